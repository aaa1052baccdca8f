//! Named, typed, hot-settable tunables
//!
//! The runtime reads a small number of configuration values (fiber stack
//! size, TCP connect timeout) through a lookup-by-name-with-default
//! registry. A value can be changed at runtime with `set`, and callers that
//! cache a value register a change listener so the running value propagates
//! without restart.
//!
//! On first lookup, `SPINDLE_<NAME>` (dots mapped to underscores, upper
//! case) overrides the built-in default, e.g. `SPINDLE_FIBER_STACK_SIZE`
//! for `fiber.stack.size`.

use std::any::Any;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

type Listener<T> = Box<dyn Fn(T, T) + Send + Sync>;

/// A single named tunable.
pub struct ConfigVar<T: Copy + PartialEq> {
    name: String,
    value: RwLock<T>,
    listeners: Mutex<Vec<Listener<T>>>,
}

impl<T: Copy + PartialEq> ConfigVar<T> {
    fn new(name: &str, value: T) -> Self {
        Self {
            name: name.to_string(),
            value: RwLock::new(value),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current value.
    #[inline]
    pub fn get(&self) -> T {
        *self.value.read().unwrap()
    }

    /// Replace the value; fires listeners with (old, new) when it changed.
    pub fn set(&self, new: T) {
        let old = {
            let mut guard = self.value.write().unwrap();
            let old = *guard;
            *guard = new;
            old
        };
        if old != new {
            for l in self.listeners.lock().unwrap().iter() {
                l(old, new);
            }
        }
    }

    /// Register a change listener, invoked with (old, new) on every change.
    pub fn add_listener(&self, f: impl Fn(T, T) + Send + Sync + 'static) {
        self.listeners.lock().unwrap().push(Box::new(f));
    }
}

fn registry() -> &'static Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>> =
        OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn env_key(name: &str) -> String {
    let mut key = String::from("SPINDLE_");
    for c in name.chars() {
        key.push(if c == '.' { '_' } else { c.to_ascii_uppercase() });
    }
    key
}

/// Look up a tunable by name, registering it with `default` on first use.
///
/// Panics if the same name was previously registered with a different type.
pub fn lookup<T>(name: &str, default: T) -> Arc<ConfigVar<T>>
where
    T: Copy + PartialEq + FromStr + Send + Sync + 'static,
{
    let mut reg = registry().lock().unwrap();
    if let Some(existing) = reg.get(name) {
        return existing
            .clone()
            .downcast::<ConfigVar<T>>()
            .unwrap_or_else(|_| panic!("config var {} registered with another type", name));
    }

    let initial = crate::env::env_get(&env_key(name), default);
    let var = Arc::new(ConfigVar::new(name, initial));
    reg.insert(name.to_string(), var.clone());
    var
}

/// Default fiber stack size tunable.
pub fn fiber_stack_size() -> Arc<ConfigVar<usize>> {
    lookup("fiber.stack.size", crate::constants::DEFAULT_STACK_SIZE)
}

/// Default TCP connect timeout tunable, in milliseconds.
pub fn tcp_connect_timeout_ms() -> Arc<ConfigVar<u64>> {
    lookup(
        "tcp.connect.timeout.ms",
        crate::constants::DEFAULT_CONNECT_TIMEOUT_MS,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_lookup_returns_same_var() {
        let a = lookup::<u64>("test.var.same", 10);
        let b = lookup::<u64>("test.var.same", 99);
        assert_eq!(a.get(), 10);
        assert_eq!(b.get(), 10);
        a.set(20);
        assert_eq!(b.get(), 20);
    }

    #[test]
    fn test_listener_fires_on_change() {
        let var = lookup::<u64>("test.var.listener", 1);
        let seen = Arc::new(AtomicU64::new(0));
        let seen2 = seen.clone();
        var.add_listener(move |_old, new| {
            seen2.store(new, Ordering::SeqCst);
        });

        var.set(5);
        assert_eq!(seen.load(Ordering::SeqCst), 5);

        // Setting the same value again must not fire.
        seen.store(0, Ordering::SeqCst);
        var.set(5);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    #[should_panic]
    fn test_type_mismatch_panics() {
        let _ = lookup::<u64>("test.var.mismatch", 1);
        let _ = lookup::<usize>("test.var.mismatch", 1);
    }

    #[test]
    fn test_env_key_mapping() {
        assert_eq!(env_key("fiber.stack.size"), "SPINDLE_FIBER_STACK_SIZE");
    }
}
