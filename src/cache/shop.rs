use std::sync::Arc;
use std::time::Duration;

use super::{Lookup, ReadThroughCache};
use crate::error::CoreError;
use crate::filter::ExistenceFilter;
use crate::models::{EntityKind, Shop};
use crate::persistence::Repository;

/// Shop reads go through the stampede-protected cache; writes go to the
/// system of record first and then invalidate (update) or register the id
/// with the existence filter (create).
pub struct ShopService {
    cache: Arc<ReadThroughCache>,
    filter: Arc<ExistenceFilter>,
    repo: Arc<dyn Repository>,
}

impl ShopService {
    pub fn new(cache: Arc<ReadThroughCache>, filter: Arc<ExistenceFilter>, repo: Arc<dyn Repository>) -> Self {
        Self { cache, filter, repo }
    }

    pub async fn get_shop(&self, shop_id: u64) -> Result<Lookup<Shop>, CoreError> {
        let deadline = self.cache.config().reload_timeout();
        self.get_shop_within(shop_id, deadline).await
    }

    /// Same as [`get_shop`](Self::get_shop) with a caller-supplied reload deadline
    pub async fn get_shop_within(&self, shop_id: u64, deadline: Duration) -> Result<Lookup<Shop>, CoreError> {
        let repo = self.repo.clone();
        let ttl = self.cache.config().shop_ttl();
        self.cache
            .get(EntityKind::Shop, shop_id, ttl, deadline, move || async move {
                repo.load_shop(shop_id).await
            })
            .await
    }

    pub async fn update_shop(&self, shop: &Shop) -> Result<(), CoreError> {
        if shop.id == 0 {
            return Err(CoreError::Invalid("shop id must not be empty".to_string()));
        }
        self.repo.save_shop(shop).await?;
        self.cache.invalidate(EntityKind::Shop, shop.id).await?;
        log::info!("Shop {} updated, cache entry invalidated", shop.id);
        Ok(())
    }

    pub async fn create_shop(&self, shop: &Shop) -> Result<u64, CoreError> {
        let shop_id = self.repo.create_shop(shop).await?;
        self.filter.add(EntityKind::Shop, shop_id).await?;
        // A lookup that raced the insert may have cached "not found"
        self.cache.invalidate(EntityKind::Shop, shop_id).await?;
        log::info!("Shop {} created", shop_id);
        Ok(shop_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::configure::{CacheConfig, FiltersConfig};
    use crate::error::RepoError;
    use crate::metrics::FlashSaleMetrics;
    use crate::persistence::InMemoryRepository;
    use crate::store::MemoryStore;

    async fn service() -> (Arc<InMemoryRepository>, ShopService) {
        let clock = Arc::new(MockClock::at_ms(1_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let repo = Arc::new(InMemoryRepository::new(clock.clone()));
        repo.insert_shop(Shop { id: 10, name: "bbq".into(), ..Default::default() });

        let filter = Arc::new(ExistenceFilter::new(store.clone(), repo.clone(), clock, FiltersConfig::default()));
        filter.warm_up().await;
        let cache = Arc::new(ReadThroughCache::new(
            store,
            filter.clone(),
            CacheConfig::default(),
            Arc::new(FlashSaleMetrics::new()),
        ));
        (repo.clone(), ShopService::new(cache, filter, repo))
    }

    #[tokio::test]
    async fn test_update_invalidates_cache() {
        let (repo, service) = service().await;
        let mut shop = service.get_shop(10).await.unwrap().found().unwrap();

        shop.name = "bbq deluxe".into();
        service.update_shop(&shop).await.unwrap();

        let reloaded = service.get_shop(10).await.unwrap().found().unwrap();
        assert_eq!(reloaded.name, "bbq deluxe");
        assert_eq!(repo.load_shop_calls(), 2);
    }

    #[tokio::test]
    async fn test_update_missing_shop() {
        let (_repo, service) = service().await;
        let missing = Shop { id: 99, ..Default::default() };
        assert_eq!(
            service.update_shop(&missing).await,
            Err(CoreError::Repository(RepoError::NotFound(99)))
        );
        assert!(matches!(service.update_shop(&Shop::default()).await, Err(CoreError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_created_shop_passes_filter() {
        let (_repo, service) = service().await;
        let id = service.create_shop(&Shop { name: "new".into(), ..Default::default() }).await.unwrap();
        let shop = service.get_shop(id).await.unwrap().found().unwrap();
        assert_eq!(shop.name, "new");
    }
}
