//! Composition root: builds every entity service over one store client and one bus.

use std::sync::Arc;

use clap::ValueEnum;
use time::Duration;
use tracing::info;

use crate::application::accessor::TableAccessor;
use crate::application::entity::{
    ArticleSchema, ArticleScope, EntityOperations, EntitySchema, EntityService, LessonStatusSchema,
    SocialPostSchema, SocialPostScope,
};
use crate::application::events::EventBus;
use crate::application::store::RemoteTableClient;
use crate::cache::{CacheConfig, EntityCacheOverlay};
use crate::util::Clock;

/// Services addressable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EntityKind {
    Articles,
    AdminArticles,
    SocialPosts,
    AdminSocialPosts,
    LessonStatus,
}

pub struct ServiceRegistry {
    pub bus: Arc<EventBus>,
    pub articles: Arc<EntityService<ArticleSchema>>,
    pub admin_articles: Arc<EntityService<ArticleSchema>>,
    pub social_posts: Arc<EntityService<SocialPostSchema>>,
    pub admin_social_posts: Arc<EntityService<SocialPostSchema>>,
    pub lesson_status: Arc<EntityService<LessonStatusSchema>>,
}

impl ServiceRegistry {
    pub fn build(
        client: Arc<dyn RemoteTableClient>,
        cache: &CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let bus = Arc::new(EventBus::new());
        let wiring = Wiring {
            client,
            bus: Arc::clone(&bus),
            clock,
            cache_enabled: cache.enabled,
        };

        let registry = Self {
            articles: wiring.service(ArticleSchema::new(ArticleScope::Public), cache.articles_ttl()),
            admin_articles: wiring.service(ArticleSchema::new(ArticleScope::Admin), cache.admin_ttl()),
            social_posts: wiring.service(
                SocialPostSchema::new(SocialPostScope::Public),
                cache.social_posts_ttl(),
            ),
            admin_social_posts: wiring.service(
                SocialPostSchema::new(SocialPostScope::Admin),
                cache.admin_ttl(),
            ),
            lesson_status: wiring.service(LessonStatusSchema, cache.lesson_status_ttl()),
            bus,
        };

        info!(cache_enabled = cache.enabled, "Entity services ready");
        registry
    }

    pub fn operations(&self, kind: EntityKind) -> Arc<dyn EntityOperations> {
        match kind {
            EntityKind::Articles => self.articles.clone(),
            EntityKind::AdminArticles => self.admin_articles.clone(),
            EntityKind::SocialPosts => self.social_posts.clone(),
            EntityKind::AdminSocialPosts => self.admin_social_posts.clone(),
            EntityKind::LessonStatus => self.lesson_status.clone(),
        }
    }
}

struct Wiring {
    client: Arc<dyn RemoteTableClient>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    cache_enabled: bool,
}

impl Wiring {
    fn service<S: EntitySchema>(&self, schema: S, ttl: Duration) -> Arc<EntityService<S>> {
        let accessor = Arc::new(TableAccessor::new(
            schema.service(),
            schema.table(),
            Arc::clone(&self.client),
            &self.bus,
            Arc::clone(&self.clock),
        ));

        let overlay = EntityCacheOverlay::new(
            schema.entity(),
            schema.table(),
            ttl,
            schema.baseline_order(),
            Arc::clone(&self.clock),
        );
        let overlay = Arc::new(if self.cache_enabled {
            overlay
        } else {
            overlay.disabled()
        });
        overlay.watch(&self.bus);

        Arc::new(EntityService::new(
            schema,
            accessor,
            overlay,
            Arc::clone(&self.bus),
            Arc::clone(&self.clock),
        ))
    }
}
