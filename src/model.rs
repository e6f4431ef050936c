use serde_json::Value;
use tracing::debug;

use crate::context::Context;
use crate::failure::FailureReason;
use crate::step::FetchFn;

/// Fetches a model and binds it under `name`.
///
/// Misses are expected outcomes: a required miss fails the context, an
/// optional one binds `null`. Blank data counts as a miss.
pub(crate) fn resolve(name: &str, fetch: &FetchFn, required: bool, ctx: &mut Context) -> bool {
    match fetch(&*ctx).filter(|value| !value.is_blank()) {
        Some(value) => {
            ctx.set(name, value);
            true
        }
        None if required => {
            debug!(model = name, "Required model not found");
            ctx.fail(FailureReason::ModelNotFound {
                name: name.to_string(),
            });
            false
        }
        None => {
            ctx.set(name, Value::Null);
            true
        }
    }
}
