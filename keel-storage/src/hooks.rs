//! Lifecycle hooks.
//!
//! Entities opt into hooks by overriding methods of [`Lifecycle`]; every
//! method defaults to a no-op, so an entity only writes the ones it needs.
//! A [`LifecycleObserver`] on the [`Context`] sees every hook of every entity
//! before the entity's own method runs.
//!
//! Put runs `Before{Create|Update}`, `BeforeSave`, the write, then
//! `After{Create|Update}`, `AfterSave`. Delete runs `BeforeDelete`, the
//! delete, `AfterDelete`. Every read runs `AfterLoad`. A failing before-hook
//! aborts the operation before anything is written.

use std::fmt;

use async_trait::async_trait;
use keel_core::{HookError, Identifier, KeelResult};

use crate::context::Context;
use crate::entity::Entity;

/// The nine lifecycle points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    BeforeCreate,
    BeforeUpdate,
    BeforeSave,
    BeforeDelete,
    AfterCreate,
    AfterUpdate,
    AfterSave,
    AfterLoad,
    AfterDelete,
}

impl Hook {
    pub const ALL: [Hook; 9] = [
        Hook::BeforeCreate,
        Hook::BeforeUpdate,
        Hook::BeforeSave,
        Hook::BeforeDelete,
        Hook::AfterCreate,
        Hook::AfterUpdate,
        Hook::AfterSave,
        Hook::AfterLoad,
        Hook::AfterDelete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Hook::BeforeCreate => "before_create",
            Hook::BeforeUpdate => "before_update",
            Hook::BeforeSave => "before_save",
            Hook::BeforeDelete => "before_delete",
            Hook::AfterCreate => "after_create",
            Hook::AfterUpdate => "after_update",
            Hook::AfterSave => "after_save",
            Hook::AfterLoad => "after_load",
            Hook::AfterDelete => "after_delete",
        }
    }

    /// True for hooks that run before the store is touched.
    pub fn is_before(&self) -> bool {
        matches!(
            self,
            Hook::BeforeCreate | Hook::BeforeUpdate | Hook::BeforeSave | Hook::BeforeDelete
        )
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-entity hook methods. Update hooks receive the stored version being
/// replaced; save hooks receive it when there is one.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    async fn before_create(&mut self, _ctx: &Context) -> KeelResult<()> {
        Ok(())
    }

    async fn before_update(&mut self, _ctx: &Context, _previous: &Self) -> KeelResult<()> {
        Ok(())
    }

    async fn before_save(&mut self, _ctx: &Context, _previous: Option<&Self>) -> KeelResult<()> {
        Ok(())
    }

    async fn before_delete(&mut self, _ctx: &Context) -> KeelResult<()> {
        Ok(())
    }

    async fn after_create(&mut self, _ctx: &Context) -> KeelResult<()> {
        Ok(())
    }

    async fn after_update(&mut self, _ctx: &Context, _previous: &Self) -> KeelResult<()> {
        Ok(())
    }

    async fn after_save(&mut self, _ctx: &Context, _previous: Option<&Self>) -> KeelResult<()> {
        Ok(())
    }

    async fn after_load(&mut self, _ctx: &Context) -> KeelResult<()> {
        Ok(())
    }

    async fn after_delete(&mut self, _ctx: &Context) -> KeelResult<()> {
        Ok(())
    }
}

/// Sees every hook invocation, for every kind.
#[async_trait]
pub trait LifecycleObserver: Send + Sync {
    /// Called before the entity's own hook method. An error aborts the hook.
    async fn on_hook(
        &self,
        _ctx: &Context,
        _hook: Hook,
        _kind: &str,
        _id: &Identifier,
    ) -> KeelResult<()> {
        Ok(())
    }
}

/// Observer that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl LifecycleObserver for NoopObserver {}

/// Run one hook on `entity`: the context observer first, then the entity's
/// own method. Update hooks require `previous`.
pub async fn run_hook<T: Entity>(
    ctx: &Context,
    entity: &mut T,
    hook: Hook,
    previous: Option<&T>,
) -> KeelResult<()> {
    tracing::trace!(ctx = ctx.label(), kind = T::KIND, %hook, "running hook");
    ctx.observer().on_hook(ctx, hook, T::KIND, entity.id()).await?;

    match hook {
        Hook::BeforeCreate => entity.before_create(ctx).await,
        Hook::BeforeUpdate => entity.before_update(ctx, require(hook, previous)?).await,
        Hook::BeforeSave => entity.before_save(ctx, previous).await,
        Hook::BeforeDelete => entity.before_delete(ctx).await,
        Hook::AfterCreate => entity.after_create(ctx).await,
        Hook::AfterUpdate => entity.after_update(ctx, require(hook, previous)?).await,
        Hook::AfterSave => entity.after_save(ctx, previous).await,
        Hook::AfterLoad => entity.after_load(ctx).await,
        Hook::AfterDelete => entity.after_delete(ctx).await,
    }
}

fn require<T>(hook: Hook, previous: Option<&T>) -> KeelResult<&T> {
    previous.ok_or_else(|| {
        HookError::Rejected {
            hook: hook.to_string(),
            reason: "update hooks need the previous version".to_string(),
        }
        .into()
    })
}

/// `Before{Create|Update}` then `BeforeSave`.
pub async fn before_put<T: Entity>(
    ctx: &Context,
    entity: &mut T,
    previous: Option<&T>,
) -> KeelResult<()> {
    let first = if previous.is_some() {
        Hook::BeforeUpdate
    } else {
        Hook::BeforeCreate
    };
    run_hook(ctx, entity, first, previous).await?;
    run_hook(ctx, entity, Hook::BeforeSave, previous).await
}

/// `After{Create|Update}` then `AfterSave`.
pub async fn after_put<T: Entity>(
    ctx: &Context,
    entity: &mut T,
    previous: Option<&T>,
) -> KeelResult<()> {
    let first = if previous.is_some() {
        Hook::AfterUpdate
    } else {
        Hook::AfterCreate
    };
    run_hook(ctx, entity, first, previous).await?;
    run_hook(ctx, entity, Hook::AfterSave, previous).await
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::KeelError;
    use serde::{Deserialize, Serialize};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Counter {
        #[serde(default)]
        id: Identifier,
        saves: u32,
        log: Vec<String>,
    }

    #[async_trait]
    impl Lifecycle for Counter {
        async fn before_update(&mut self, _ctx: &Context, previous: &Self) -> KeelResult<()> {
            self.log.push(format!("update from {}", previous.saves));
            Ok(())
        }

        async fn before_save(&mut self, _ctx: &Context, _previous: Option<&Self>) -> KeelResult<()> {
            self.saves += 1;
            Ok(())
        }

        async fn before_delete(&mut self, _ctx: &Context) -> KeelResult<()> {
            Err(HookError::Rejected {
                hook: Hook::BeforeDelete.to_string(),
                reason: "counters are forever".to_string(),
            }
            .into())
        }
    }

    impl Entity for Counter {
        const KIND: &'static str = "Counter";

        fn id(&self) -> &Identifier {
            &self.id
        }

        fn set_id(&mut self, id: Identifier) {
            self.id = id;
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Hook>>,
    }

    #[async_trait]
    impl LifecycleObserver for Recorder {
        async fn on_hook(
            &self,
            _ctx: &Context,
            hook: Hook,
            _kind: &str,
            _id: &Identifier,
        ) -> KeelResult<()> {
            self.seen.lock().unwrap().push(hook);
            Ok(())
        }
    }

    #[test]
    fn test_hook_names() {
        assert_eq!(Hook::ALL.len(), 9);
        assert_eq!(Hook::AfterLoad.as_str(), "after_load");
        assert_eq!(Hook::BeforeSave.to_string(), "before_save");
        assert!(Hook::BeforeDelete.is_before());
        assert!(!Hook::AfterDelete.is_before());
    }

    #[tokio::test]
    async fn test_before_put_create_sequence() {
        let recorder = Arc::new(Recorder::default());
        let ctx = Context::background().with_observer(recorder.clone());
        let mut counter = Counter::default();

        before_put(&ctx, &mut counter, None).await.unwrap();
        after_put(&ctx, &mut counter, None).await.unwrap();

        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![
                Hook::BeforeCreate,
                Hook::BeforeSave,
                Hook::AfterCreate,
                Hook::AfterSave
            ]
        );
        assert_eq!(counter.saves, 1);
    }

    #[tokio::test]
    async fn test_before_put_update_sees_previous() {
        let ctx = Context::background();
        let previous = Counter {
            saves: 4,
            ..Counter::default()
        };
        let mut counter = previous.clone();

        before_put(&ctx, &mut counter, Some(&previous)).await.unwrap();
        assert_eq!(counter.log, vec!["update from 4".to_string()]);
        assert_eq!(counter.saves, 5);
    }

    #[tokio::test]
    async fn test_rejecting_hook_returns_error() {
        let ctx = Context::background();
        let mut counter = Counter::default();
        let err = run_hook(&ctx, &mut counter, Hook::BeforeDelete, None)
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::Hook(HookError::Rejected { .. })));
    }

    #[tokio::test]
    async fn test_update_hook_without_previous_is_rejected() {
        let ctx = Context::background();
        let mut counter = Counter::default();
        assert!(run_hook(&ctx, &mut counter, Hook::AfterUpdate, None)
            .await
            .is_err());
    }
}
