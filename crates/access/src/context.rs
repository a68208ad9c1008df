//! Tenant context propagation. A task-local scoped value carries the
//! {organization, user, superadmin} triple for the dynamic extent of one
//! logical operation, and the same triple is mirrored into the storage
//! session so row-level filtering sees identical values.

use std::future::Future;

use tenantgate_core::error::{GateError, GateResult};
use tenantgate_core::types::TenantContext;
use tenantgate_store::traits::SessionScope;
use tracing::debug;

tokio::task_local! {
    static TENANT_CONTEXT: TenantContext;
}

/// Establish `ctx` for the dynamic extent of `op`.
///
/// The context is visible through [`current_context`] from everything
/// `op` awaits, including across suspension points, and is invisible to
/// concurrently running sibling operations. Before `op` runs the context
/// is bound into the storage session (`SessionScope::bind`); it is
/// released on the way out whether `op` succeeds or fails, so a pooled
/// connection never carries stale tenant state into the next operation.
///
/// Nesting is legal: an inner `run_scoped` fully shadows the outer
/// context for its own extent.
pub async fn run_scoped<S, F, T>(scope: &S, ctx: TenantContext, op: F) -> GateResult<T>
where
    S: SessionScope + ?Sized,
    F: Future<Output = GateResult<T>>,
{
    let session_ctx = ctx.clone();
    TENANT_CONTEXT
        .scope(ctx, async move {
            debug!(
                organization_id = %session_ctx.organization_id,
                user_id = %session_ctx.user_id,
                superadmin = session_ctx.superadmin,
                "Tenant scope established"
            );
            scope.bind(&session_ctx).await?;
            let result = op.await;
            let released = scope.release().await;
            // The operation's own error wins; a release failure only
            // surfaces when the operation itself succeeded.
            let value = result?;
            released?;
            Ok(value)
        })
        .await
}

/// The current tenant context, or `None` outside any scoped operation.
pub fn current_context() -> Option<TenantContext> {
    TENANT_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

/// The current tenant context, failing with `ContextMissing` when called
/// outside any scoped operation. For code paths that must never run
/// untenanted.
pub fn require_context() -> GateResult<TenantContext> {
    current_context().ok_or(GateError::ContextMissing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tenantgate_store::memory::MemoryControlStore;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_context_visible_inside_scope_only() {
        let store = MemoryControlStore::new();
        let ctx = TenantContext::new(Uuid::new_v4(), Uuid::new_v4());

        assert!(current_context().is_none());
        assert!(matches!(
            require_context(),
            Err(GateError::ContextMissing)
        ));

        let expected = ctx.clone();
        run_scoped(&store, ctx, async move {
            let seen = require_context()?;
            assert_eq!(seen, expected);
            Ok(())
        })
        .await
        .unwrap();

        assert!(current_context().is_none());
    }

    #[tokio::test]
    async fn test_session_scope_bound_for_exact_extent() {
        let store = Arc::new(MemoryControlStore::new());
        let ctx = TenantContext::new(Uuid::new_v4(), Uuid::new_v4());

        let inner_store = store.clone();
        let inner_ctx = ctx.clone();
        run_scoped(store.as_ref(), ctx, async move {
            assert_eq!(inner_store.current_scope(), Some(inner_ctx));
            Ok(())
        })
        .await
        .unwrap();

        // Released after the operation, success or not.
        assert!(store.current_scope().is_none());

        let failing: GateResult<()> = run_scoped(
            store.as_ref(),
            TenantContext::new(Uuid::new_v4(), Uuid::new_v4()),
            async { Err(GateError::Store("boom".into())) },
        )
        .await;
        assert!(failing.is_err());
        assert!(store.current_scope().is_none());
    }

    #[tokio::test]
    async fn test_nested_scope_shadows_outer() {
        let store = Arc::new(MemoryControlStore::new());
        let outer = TenantContext::new(Uuid::new_v4(), Uuid::new_v4());
        let inner = TenantContext::new(Uuid::new_v4(), Uuid::new_v4());

        let store2 = store.clone();
        let outer2 = outer.clone();
        let inner2 = inner.clone();
        run_scoped(store.as_ref(), outer, async move {
            let before = require_context()?;
            assert_eq!(before, outer2);

            let inner3 = inner2.clone();
            run_scoped(store2.as_ref(), inner2, async move {
                assert_eq!(require_context()?, inner3);
                Ok(())
            })
            .await?;

            // Outer context restored after the inner extent.
            assert_eq!(require_context()?, outer2);
            assert_eq!(store2.current_scope(), Some(outer2.clone()));
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_operations_are_isolated() {
        let store_a = Arc::new(MemoryControlStore::new());
        let store_b = Arc::new(MemoryControlStore::new());
        let ctx_a = TenantContext::new(Uuid::new_v4(), Uuid::new_v4());
        let ctx_b = TenantContext::new(Uuid::new_v4(), Uuid::new_v4());

        let expect_a = ctx_a.clone();
        let task_a = tokio::spawn(async move {
            run_scoped(store_a.as_ref(), ctx_a, async move {
                for _ in 0..5 {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    assert_eq!(require_context()?, expect_a);
                }
                Ok(())
            })
            .await
        });

        let expect_b = ctx_b.clone();
        let task_b = tokio::spawn(async move {
            run_scoped(store_b.as_ref(), ctx_b, async move {
                for _ in 0..5 {
                    tokio::time::sleep(Duration::from_millis(3)).await;
                    assert_eq!(require_context()?, expect_b);
                }
                Ok(())
            })
            .await
        });

        task_a.await.unwrap().unwrap();
        task_b.await.unwrap().unwrap();
    }
}
