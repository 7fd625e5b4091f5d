//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # ポイント
//! - Builder パターンで ports を差し替え可能にする（テストでは FixedClock / SequentialIdGenerator）
//! - 起動時検証（Fail-fast 設計）: 設定値と、必要なロールのファクトリが揃っているか
//! - push 経路（SyncHub）は Coordinator の EventSink として配線する

use std::sync::Arc;

use tracing::info;

use super::App;
use crate::config::ForemanConfig;
use crate::coordinator::{Coordinator, CoordinatorParts};
use crate::domain::{ConfigError, Decider, PoolError, Role};
use crate::impls::InMemoryBlockerStore;
use crate::pool::FactoryRegistry;
use crate::ports::{BlockerStore, Clock, IdGenerator, SystemClock, UlidGenerator, WorkerFactory};
use crate::sync::SyncHub;

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new()
///     .register(Role::Backend, Arc::new(MyFactory))?
///     .expect_roles(&[Role::Backend])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - expect_roles() で必要なロールを宣言
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 不足があれば BuildError::MissingRoles を返す
pub struct AppBuilder {
    registry: FactoryRegistry,
    config: ForemanConfig,
    clock: Arc<dyn Clock>,
    /// Defaults to ULIDs stamped by `clock`.
    ids: Option<Arc<dyn IdGenerator>>,
    store: Arc<dyn BlockerStore>,
    decider: Option<Arc<dyn Decider>>,
    expected_roles: Option<Vec<Role>>,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing worker factories for roles {0:?}; these roles were expected but not registered")]
    MissingRoles(Vec<Role>),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            registry: FactoryRegistry::new(),
            config: ForemanConfig::default(),
            clock: Arc::new(SystemClock),
            ids: None,
            store: Arc::new(InMemoryBlockerStore::new()),
            decider: None,
            expected_roles: None,
        }
    }

    /// ロールにファクトリを登録（同じロールの二重登録はエラー）
    pub fn register(mut self, role: Role, factory: Arc<dyn WorkerFactory>) -> Result<Self, PoolError> {
        self.registry.register(role, factory)?;
        Ok(self)
    }

    /// すべてのロールに同じファクトリを登録
    pub fn register_all(mut self, factory: Arc<dyn WorkerFactory>) -> Result<Self, PoolError> {
        for role in Role::ALL {
            self.registry.register(role, Arc::clone(&factory))?;
        }
        Ok(self)
    }

    pub fn config(mut self, config: ForemanConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn store(mut self, store: Arc<dyn BlockerStore>) -> Self {
        self.store = store;
        self
    }

    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    /// 必要なロールを宣言（build() で検証）
    pub fn expect_roles(mut self, roles: &[Role]) -> Self {
        self.expected_roles = Some(roles.to_vec());
        self
    }

    /// # 検証
    /// - 設定値（`ForemanConfig::validate`）
    /// - expect_roles() のロールがすべて登録されているか
    pub fn build(self) -> Result<App, BuildError> {
        self.config.validate()?;
        if let Some(expected) = &self.expected_roles {
            let registered = self.registry.roles();
            let missing: Vec<Role> = expected
                .iter()
                .copied()
                .filter(|role| !registered.contains(role))
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingRoles(missing));
            }
        }

        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&self.clock))));
        let hub = Arc::new(SyncHub::new(self.config.event_buffer, Arc::clone(&self.clock)));
        let coordinator = Coordinator::new(CoordinatorParts {
            config: self.config,
            registry: self.registry,
            store: self.store,
            clock: self.clock,
            ids,
            events: hub.clone(),
            decider: self.decider,
        });
        info!(project_id = %coordinator.project_id(), "app built");
        Ok(App::new(coordinator, hub))
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::ScriptedWorkerFactory;

    fn factory() -> Arc<dyn WorkerFactory> {
        Arc::new(ScriptedWorkerFactory::default())
    }

    #[test]
    fn build_success() {
        let app = AppBuilder::new()
            .register_all(factory())
            .unwrap()
            .expect_roles(&Role::ALL)
            .build();
        assert!(app.is_ok());
    }

    #[test]
    fn build_missing_roles() {
        let app = AppBuilder::new()
            .register(Role::Backend, factory())
            .unwrap()
            .expect_roles(&[Role::Backend, Role::Test])
            .build();
        assert!(matches!(
            app,
            Err(BuildError::MissingRoles(missing)) if missing == vec![Role::Test]
        ));
    }

    #[test]
    fn duplicate_role_is_rejected() {
        let result = AppBuilder::new()
            .register(Role::Backend, factory())
            .unwrap()
            .register(Role::Backend, factory());
        assert!(matches!(result, Err(PoolError::DuplicateRole(Role::Backend))));
    }

    #[test]
    fn invalid_config_fails_fast() {
        let app = AppBuilder::new()
            .config(ForemanConfig {
                max_slots: 0,
                ..ForemanConfig::default()
            })
            .build();
        assert!(matches!(app, Err(BuildError::Config(ConfigError::Invalid(_)))));
    }
}
