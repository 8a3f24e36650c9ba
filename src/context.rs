//! Per-request key/value bag.
//!
//! Every [`Request`](crate::Request) carries a [`Context`]. It starts out
//! *detached*: no bag is installed, [`Context::set`] does nothing and
//! [`Context::get`] returns `None`. The
//! [`ContextInit`](crate::middleware::context::ContextInit) middleware
//! installs an empty bag at the front of the chain, after which every later
//! middleware and the handler share it.
//!
//! Values are stored as [`serde_json::Value`] so the whole bag can be handed
//! to a log record as-is. For compile-time checked access use a [`Key`]:
//!
//! ```rust
//! use svckit::context::{Context, Key};
//!
//! const ATTEMPTS: Key<u32> = Key::new("attempts");
//!
//! let mut ctx = Context::detached();
//! ctx.init();
//! ATTEMPTS.set(&mut ctx, 3);
//! assert_eq!(ATTEMPTS.get(&ctx), Some(3));
//! ```
//!
//! The bag moves with the request from one middleware to the next, so there
//! is only ever one writer. It has no internal locking; share it with
//! spawned tasks only behind your own synchronisation.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// The request-scoped bag. See the [module docs](self).
#[derive(Clone, Debug, Default)]
pub struct Context {
    bag: Option<HashMap<String, Value>>,
}

impl Context {
    /// A context without a bag. Writes are dropped, reads return `None`.
    pub fn detached() -> Self {
        Self { bag: None }
    }

    /// Installs a fresh, empty bag, discarding any previous one.
    pub fn init(&mut self) {
        self.bag = Some(HashMap::new());
    }

    /// Returns `true` once [`init`](Context::init) has run.
    pub fn is_attached(&self) -> bool {
        self.bag.is_some()
    }

    /// Stores `value` under `key`. No-op on a detached context.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        if let Some(bag) = self.bag.as_mut() {
            bag.insert(key.into(), value.into());
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.bag.as_ref()?.get(key)
    }

    /// Shorthand for string entries such as the request id.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    /// Removes and returns the value under `key`.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.bag.as_mut()?.remove(key)
    }

    /// An independent copy of every entry, ready for iteration or logging.
    ///
    /// Empty when the context is detached.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.bag
            .iter()
            .flatten()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// A typed handle on one bag entry.
///
/// `set` serialises the value into the bag and `get` deserialises it back.
/// An entry written with a different shape reads as `None`.
pub struct Key<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    pub const fn new(name: &'static str) -> Self {
        Self { name, _marker: PhantomData }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T: Serialize + DeserializeOwned> Key<T> {
    pub fn set(&self, ctx: &mut Context, value: T) {
        // Values that cannot be represented as JSON (maps with non-string
        // keys, failing Serialize impls) are dropped like writes to a
        // detached context.
        if let Ok(value) = serde_json::to_value(value) {
            ctx.set(self.name, value);
        }
    }

    pub fn get(&self, ctx: &Context) -> Option<T> {
        let value = ctx.get(self.name)?;
        serde_json::from_value(value.clone()).ok()
    }
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Key<T> {}

impl<T> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Key").field(&self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn detached_context_ignores_writes() {
        let mut ctx = Context::detached();
        ctx.set("key", "value");
        assert!(!ctx.is_attached());
        assert_eq!(ctx.get("key"), None);
        assert!(ctx.snapshot().is_empty());
    }

    #[test]
    fn last_write_wins() {
        let mut ctx = Context::default();
        ctx.init();
        ctx.set("key", "first");
        ctx.set("key", "second");
        assert_eq!(ctx.get_str("key"), Some("second"));
        assert_eq!(ctx.get("missing"), None);
    }

    #[test]
    fn snapshot_is_independent_of_the_bag() {
        let mut ctx = Context::default();
        ctx.init();
        ctx.set("a", 1);
        let mut snap = ctx.snapshot();
        snap.insert("b".into(), Value::from(2));
        ctx.set("a", 10);

        assert_eq!(snap.get("a"), Some(&Value::from(1)));
        assert_eq!(ctx.get("b"), None);
    }

    #[test]
    fn init_discards_previous_entries() {
        let mut ctx = Context::default();
        ctx.init();
        ctx.set("a", true);
        ctx.init();
        assert_eq!(ctx.get("a"), None);
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct User {
        id: u64,
        name: String,
    }

    #[test]
    fn typed_keys_round_trip_structs() {
        const USER: Key<User> = Key::new("user");
        let mut ctx = Context::default();
        ctx.init();
        USER.set(&mut ctx, User { id: 7, name: "ada".into() });

        assert_eq!(USER.get(&ctx), Some(User { id: 7, name: "ada".into() }));
        assert_eq!(ctx.snapshot()["user"]["name"], "ada");
    }

    #[test]
    fn typed_key_with_wrong_shape_reads_none() {
        const COUNT: Key<u32> = Key::new("count");
        let mut ctx = Context::default();
        ctx.init();
        ctx.set("count", "not a number");
        assert_eq!(COUNT.get(&ctx), None);
    }
}
