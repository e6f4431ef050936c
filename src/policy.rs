use std::sync::Arc;

use tracing::{debug, warn};

use crate::context::Context;
use crate::failure::FailureReason;
use crate::step::PolicyFn;

/// Externally supplied holder of authorization predicates.
pub trait Guardian: Send + Sync {
    fn allows(&self, permission: &str, ctx: &Context) -> bool;
}

/// Predicate that asks the context's guardian for `permission`.
///
/// A context without a guardian is denied.
pub fn guardian_check(permission: impl Into<String>) -> PolicyFn {
    let permission = permission.into();
    Arc::new(move |ctx: &Context| match ctx.guardian() {
        Some(guardian) => guardian.allows(&permission, ctx),
        None => {
            warn!(permission = permission.as_str(), "No guardian bound to context");
            false
        }
    })
}

/// Evaluates a policy step, failing the context when it denies.
pub(crate) fn evaluate(name: &str, predicate: &PolicyFn, ctx: &mut Context) -> bool {
    let allowed = predicate(&*ctx);
    if !allowed {
        debug!(policy = name, "Policy denied");
        ctx.fail(FailureReason::PolicyViolation {
            name: name.to_string(),
        });
    }
    allowed
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Staff;

    impl Guardian for Staff {
        fn allows(&self, permission: &str, _ctx: &Context) -> bool {
            permission == "can_moderate"
        }
    }

    #[test]
    fn guardian_check_delegates_permission() {
        let ctx = Context::default().with_guardian(Arc::new(Staff));
        assert!(guardian_check("can_moderate")(&ctx));
        assert!(!guardian_check("can_delete_channel")(&ctx));
    }

    #[test]
    fn missing_guardian_denies() {
        let ctx = Context::default();
        assert!(!guardian_check("can_moderate")(&ctx));
    }

    #[test]
    fn denial_fails_context_with_policy_name() {
        let mut ctx = Context::default();
        let predicate: PolicyFn = Arc::new(|_: &Context| false);
        assert!(!evaluate("is_admin", &predicate, &mut ctx));
        assert_eq!(
            ctx.failure_reason(),
            Some(&FailureReason::PolicyViolation {
                name: "is_admin".into()
            })
        );
    }
}
