//! Renting and returning self-referential pooled sources.
//!
//! Pooled sources keep a `Weak` to their own `Arc` so that the consumer
//! calling `get_result` through a `&self` trait method can put the object
//! back into its pool.

use std::sync::{Arc, Weak};

use slot_pool::pool_of;

/// Pops an idle `P` from its pool or builds one with `create`.
#[inline]
pub fn rent<P, F>(create: F) -> Arc<P>
where
    P: Send + Sync + 'static,
    F: FnOnce(&Weak<P>) -> P,
{
    pool_of::<P>().pop_or_else(|| Arc::new_cyclic(create))
}

/// Returns the object behind `me` to its pool.
#[inline]
pub fn give_back<P: Send + Sync + 'static>(me: &Weak<P>) -> bool {
    match me.upgrade() {
        Some(me) => pool_of::<P>().try_push(me),
        None => false,
    }
}
