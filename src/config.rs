//! Environment-overridable knobs, following the `cmd_util::env::env_config` +
//! `LazyLock` pattern used throughout the teacher workspace's
//! `common/src/knobs.rs`.
use std::{
    env,
    fmt::Debug,
    str::FromStr,
    sync::LazyLock,
};

pub fn env_config<T: Debug + FromStr>(name: &str, default: T) -> T
where
    <T as FromStr>::Err: Debug,
{
    let var = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };
    match T::from_str(&var) {
        Ok(v) => {
            tracing::info!("Overriding {name} to {v:?} from environment");
            v
        },
        Err(e) => {
            tracing::warn!("Invalid value {var} for {name}, falling back to {default:?}: {e:?}");
            default
        },
    }
}

/// Default `count` passed to `getOverlaysForCollectionGroup` by callers that
/// don't have a better number in hand.
pub static OVERLAY_COLLECTION_GROUP_DEFAULT_COUNT: LazyLock<usize> =
    LazyLock::new(|| env_config("OVERLAY_COLLECTION_GROUP_DEFAULT_COUNT", 128));

/// `recalculate_and_save_overlays` logs a warning if asked to process more
/// than this many distinct mutation batches in one call.
pub static OVERLAY_RECALCULATION_BATCH_WARN_THRESHOLD: LazyLock<usize> =
    LazyLock::new(|| env_config("OVERLAY_RECALCULATION_BATCH_WARN_THRESHOLD", 500));
