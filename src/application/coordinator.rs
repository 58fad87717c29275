//! Post mutations with their asynchronous follow-ups.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::application::background::{BackgroundDispatcher, BackgroundJob};
use crate::application::error::AppError;
use crate::application::repos::PostsWriteRepo;
use crate::domain::error::DomainError;
use crate::domain::events::LifecycleEvent;
use crate::domain::types::{PostAction, PostId, UserId};

/// Longest accepted post body, in characters.
pub const MAX_POST_TEXT_CHARS: usize = 1000;

fn validate_text(text: &str) -> Result<(), DomainError> {
    if text.trim().is_empty() {
        return Err(DomainError::validation("post text must not be empty"));
    }
    if text.chars().count() > MAX_POST_TEXT_CHARS {
        return Err(DomainError::validation(format!(
            "post text must be at most {MAX_POST_TEXT_CHARS} characters"
        )));
    }
    Ok(())
}

fn validate_post_id(post_id: &PostId) -> Result<(), DomainError> {
    if post_id.is_empty() {
        return Err(DomainError::validation("post id must not be empty"));
    }
    Ok(())
}

/// Commits post changes synchronously, then hands the warm task and the lifecycle event to
/// the background dispatcher. Callers never wait on the queue or the bus.
#[derive(Clone)]
pub struct PostMutationCoordinator {
    posts: Arc<dyn PostsWriteRepo>,
    dispatcher: BackgroundDispatcher,
}

impl PostMutationCoordinator {
    pub fn new(posts: Arc<dyn PostsWriteRepo>, dispatcher: BackgroundDispatcher) -> Self {
        Self { posts, dispatcher }
    }

    #[instrument(skip(self, text), fields(author_id = %author_id))]
    pub async fn create_post(&self, author_id: UserId, text: &str) -> Result<PostId, AppError> {
        validate_text(text)?;
        let record = self.posts.create_post(author_id, text).await?;
        info!(post_id = %record.id, "Post created");
        self.after_commit(LifecycleEvent::new(
            record.id.clone(),
            author_id,
            PostAction::Create,
            Some(record.text),
        ));
        Ok(record.id)
    }

    #[instrument(skip(self, text), fields(author_id = %author_id, post_id = %post_id))]
    pub async fn update_post(
        &self,
        author_id: UserId,
        post_id: &PostId,
        text: &str,
    ) -> Result<(), AppError> {
        validate_post_id(post_id)?;
        validate_text(text)?;
        let record = self.posts.update_post(author_id, post_id, text).await?;
        info!("Post updated");
        self.after_commit(LifecycleEvent::new(
            record.id,
            author_id,
            PostAction::Update,
            Some(record.text),
        ));
        Ok(())
    }

    #[instrument(skip(self), fields(author_id = %author_id, post_id = %post_id))]
    pub async fn delete_post(&self, author_id: UserId, post_id: &PostId) -> Result<(), AppError> {
        validate_post_id(post_id)?;
        self.posts.delete_post(author_id, post_id).await?;
        info!("Post deleted");
        self.after_commit(LifecycleEvent::new(
            post_id.clone(),
            author_id,
            PostAction::Delete,
            None,
        ));
        Ok(())
    }

    /// Both jobs share the author's lane, so the warm task is appended before the event.
    fn after_commit(&self, event: LifecycleEvent) {
        self.dispatcher
            .submit(BackgroundJob::EnqueueWarm(event.author_id));
        self.dispatcher.submit(BackgroundJob::Publish(event));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::application::background::{DispatchConfig, JobRunner};
    use crate::application::preloader::FeedPreloader;
    use crate::application::testing::FakeGraph;
    use crate::cache::{CacheConfig, FeedCache, MemoryCacheStore};
    use crate::events::{EventBus, MemoryEventBus};
    use crate::queue::{MemoryWorkQueue, WorkQueue};

    struct Fixture {
        coordinator: PostMutationCoordinator,
        dispatcher: BackgroundDispatcher,
        queue: MemoryWorkQueue,
        bus: MemoryEventBus,
    }

    fn fixture(graph: &Arc<FakeGraph>) -> Fixture {
        let config = CacheConfig::default();
        let cache = FeedCache::new(Arc::new(MemoryCacheStore::new(&config)), config);
        let queue = MemoryWorkQueue::new("cache_workers");
        let bus = MemoryEventBus::new(1);
        let dispatch = DispatchConfig::default();
        let runner = JobRunner::new(
            Arc::new(queue.clone()),
            Arc::new(bus.clone()),
            FeedPreloader::new(graph.clone(), graph.clone(), cache),
            &dispatch,
        );
        let dispatcher = BackgroundDispatcher::start(runner, &dispatch);
        Fixture {
            coordinator: PostMutationCoordinator::new(graph.clone(), dispatcher.clone()),
            dispatcher,
            queue,
            bus,
        }
    }

    #[test]
    fn text_validation_counts_characters() {
        assert!(validate_text("ok").is_ok());
        assert!(validate_text("   ").is_err());
        assert!(validate_text(&"é".repeat(MAX_POST_TEXT_CHARS)).is_ok());
        assert!(validate_text(&"a".repeat(MAX_POST_TEXT_CHARS + 1)).is_err());
    }

    #[tokio::test]
    async fn each_mutation_enqueues_and_publishes() {
        let graph = Arc::new(FakeGraph::default());
        let fixture = fixture(&graph);
        let mut events = fixture.bus.subscribe("g", "c").await.expect("subscribe");
        fixture.queue.ensure_group().await.expect("group");

        let author = UserId::new(4);
        let post_id = fixture
            .coordinator
            .create_post(author, "first")
            .await
            .expect("create");
        fixture
            .coordinator
            .update_post(author, &post_id, "second")
            .await
            .expect("update");
        fixture
            .coordinator
            .delete_post(author, &post_id)
            .await
            .expect("delete");
        fixture
            .dispatcher
            .shutdown(Instant::now() + Duration::from_secs(5))
            .await;

        assert_eq!(fixture.queue.backlog_len(), 3);
        let batch = events
            .next_batch(10, Duration::from_millis(10))
            .await
            .expect("events");
        let decoded: Vec<LifecycleEvent> = batch
            .iter()
            .map(|env| serde_json::from_slice(&env.payload).expect("event"))
            .collect();
        let actions: Vec<PostAction> = decoded.iter().map(|event| event.action).collect();
        assert_eq!(
            actions,
            vec![PostAction::Create, PostAction::Update, PostAction::Delete]
        );
        assert_eq!(decoded[1].text.as_deref(), Some("second"));
        assert!(decoded[2].text.is_none());
        assert!(decoded.iter().all(|event| event.post_id == post_id));
    }

    #[tokio::test]
    async fn invalid_input_commits_nothing() {
        let graph = Arc::new(FakeGraph::default());
        let fixture = fixture(&graph);

        let err = fixture
            .coordinator
            .create_post(UserId::new(1), "")
            .await
            .expect_err("empty text");
        assert!(matches!(err, AppError::Domain(DomainError::Validation { .. })));

        let err = fixture
            .coordinator
            .delete_post(UserId::new(1), &PostId::new(" "))
            .await
            .expect_err("empty id");
        assert!(matches!(err, AppError::Domain(DomainError::Validation { .. })));

        fixture
            .dispatcher
            .shutdown(Instant::now() + Duration::from_secs(5))
            .await;
        assert_eq!(fixture.queue.backlog_len(), 0);
    }

    #[tokio::test]
    async fn not_found_and_not_owner_are_distinct() {
        let graph = Arc::new(FakeGraph::default());
        let fixture = fixture(&graph);
        let post = graph.seed_post(1, "mine");

        let err = fixture
            .coordinator
            .update_post(UserId::new(2), &post.id, "theirs")
            .await
            .expect_err("not owner");
        assert!(matches!(err, AppError::Domain(DomainError::NotOwner { .. })));

        let err = fixture
            .coordinator
            .delete_post(UserId::new(1), &PostId::new("missing"))
            .await
            .expect_err("not found");
        assert!(matches!(err, AppError::Domain(DomainError::NotFound { .. })));
    }
}
