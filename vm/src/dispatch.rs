//! Method lookup and the inline caches.
//!
//! Both caches are single-slot direct-mapped and keyed by method
//! identity; the selector only feeds the hash. Identity probing stays
//! correct across collections because every entry's `method` field is a
//! GC root (visited through [`MethodCache::visit_roots`]), so live
//! entries are rewritten in place on every flip.

use heap::HandleSet;
use object::{class_of, ByteObject, Class, Context, Dictionary, Globals, Method, RawObject, Value};

use crate::alloc;
use crate::compile::NativeEntry;
use crate::{Control, ExecResult, Runtime, RuntimeError};

/// Entries per cache; must be a power of two.
pub const CACHE_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Clone)]
struct MethodEntry {
    method: Value,
    native: Option<NativeEntry>,
}

/// method → native entry, probed by `(method ^ selector) mod size`.
pub struct MethodCache {
    entries: Vec<MethodEntry>,
    stats: CacheStats,
}

impl MethodCache {
    pub fn new() -> Self {
        Self {
            entries: vec![
                MethodEntry { method: Value::NULL, native: None };
                CACHE_SIZE
            ],
            stats: CacheStats::default(),
        }
    }

    fn index(method: Value, selector: Value) -> usize {
        ((method.raw() ^ selector.raw()) as usize) & (CACHE_SIZE - 1)
    }

    pub fn probe(&mut self, method: Value) -> Option<NativeEntry> {
        let selector = unsafe { method.as_ref::<Method>() }.name;
        let entry = &self.entries[Self::index(method, selector)];
        if entry.method == method {
            self.stats.hits += 1;
            entry.native.clone()
        } else {
            self.stats.misses += 1;
            None
        }
    }

    /// On miss the colliding entry is overwritten.
    pub fn update(&mut self, method: Value, native: NativeEntry) {
        let selector = unsafe { method.as_ref::<Method>() }.name;
        let index = Self::index(method, selector);
        self.entries[index] = MethodEntry { method, native: Some(native) };
    }

    pub fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for entry in self.entries.iter_mut() {
            if !entry.method.is_null() {
                visitor(&mut entry.method);
            }
        }
    }

    /// Every non-empty entry's method, for coherence checks.
    pub fn live_methods(&self) -> Vec<Value> {
        self.entries
            .iter()
            .filter(|e| !e.method.is_null())
            .map(|e| e.method)
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

impl Default for MethodCache {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
struct BlockEntry {
    method: Value,
    block_ip: usize,
    native: Option<NativeEntry>,
}

/// (method, block byte offset) → native entry.
pub struct BlockCache {
    entries: Vec<BlockEntry>,
    stats: CacheStats,
}

impl BlockCache {
    pub fn new() -> Self {
        Self {
            entries: vec![
                BlockEntry { method: Value::NULL, block_ip: 0, native: None };
                CACHE_SIZE
            ],
            stats: CacheStats::default(),
        }
    }

    fn index(method: Value, block_ip: usize) -> usize {
        let selector = unsafe { method.as_ref::<Method>() }.name;
        ((method.raw() ^ selector.raw()) as usize ^ block_ip) & (CACHE_SIZE - 1)
    }

    pub fn probe(&mut self, method: Value, block_ip: usize) -> Option<NativeEntry> {
        let entry = &self.entries[Self::index(method, block_ip)];
        if entry.method == method && entry.block_ip == block_ip {
            self.stats.hits += 1;
            entry.native.clone()
        } else {
            self.stats.misses += 1;
            None
        }
    }

    pub fn update(&mut self, method: Value, block_ip: usize, native: NativeEntry) {
        let index = Self::index(method, block_ip);
        self.entries[index] = BlockEntry { method, block_ip, native: Some(native) };
    }

    pub fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for entry in self.entries.iter_mut() {
            if !entry.method.is_null() {
                visitor(&mut entry.method);
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Symbols compare by identity first (interning makes that the common
/// case), then by byte content.
fn symbol_matches(a: Value, b: Value) -> bool {
    if a == b {
        return true;
    }
    if !a.is_ref() || !b.is_ref() {
        return false;
    }
    let (a, b) = unsafe { (a.as_ref::<ByteObject>(), b.as_ref::<ByteObject>()) };
    a.header.size.is_binary() && b.header.size.is_binary() && a.bytes() == b.bytes()
}

fn dictionary_find(globals: &Globals, dictionary: Value, selector: Value) -> Option<Value> {
    if !dictionary.is_ref() || dictionary == globals.nil {
        return None;
    }
    let dict: &Dictionary = unsafe { dictionary.as_ref() };
    if !dict.keys.is_ref() {
        return None;
    }
    let keys: &RawObject = unsafe { dict.keys.as_ref() };
    let values: &RawObject = unsafe { dict.values.as_ref() };
    for i in 0..keys.slot_count() {
        if symbol_matches(keys.field_at(i), selector) {
            return Some(values.field_at(i));
        }
    }
    None
}

/// Walk the method dictionary of `class` and its superclass chain;
/// first match wins. The result is not cached here.
pub fn lookup_method(globals: &Globals, selector: Value, class: Value) -> Option<Value> {
    let span = tracing::span!(tracing::Level::TRACE, "lookup");
    let _guard = span.enter();

    let mut current = class;
    while current.is_ref() && current != globals.nil {
        let c: &Class = unsafe { current.as_ref() };
        if let Some(method) = dictionary_find(globals, c.methods, selector) {
            return Some(method);
        }
        current = c.parent;
    }
    None
}

/// The `sendMessage` runtime callback.
///
/// Resolves the method (falling back to `doesNotUnderstand:` with
/// `[receiver, selector]` arguments), consults the method cache,
/// compiles on miss, activates a fresh context, and converts a
/// non-local return targeted at that context into a normal return.
pub fn send_message(
    rt: &mut Runtime,
    calling_context: Value,
    selector: Value,
    arguments: Value,
    receiver_class: Option<Value>,
) -> ExecResult {
    rt.counters.messages_dispatched += 1;
    let span = tracing::span!(tracing::Level::TRACE, "send");
    let _guard = span.enter();

    let hs = HandleSet::new(&mut rt.memory);
    let caller_h = hs.pin_value::<Context>(calling_context);
    let selector_h = hs.pin_value::<ByteObject>(selector);
    let arguments_h = hs.pin_value::<RawObject>(arguments);

    let class = match receiver_class {
        Some(class) => class,
        None => class_of(arguments_h.field_at(0), &rt.globals),
    };

    let method_h = match lookup_method(&rt.globals, selector_h.value(), class) {
        Some(method) => hs.pin_value::<Method>(method),
        None => {
            // Replace the arguments with [receiver, selector] and
            // continue as if doesNotUnderstand: had been sent.
            let dnu = rt.globals.does_not_understand;
            let Some(method) = lookup_method(&rt.globals, dnu, class) else {
                return Err(RuntimeError::NoDoesNotUnderstand {
                    selector: rt.symbol_text(selector_h.value()),
                });
            };
            let method_h = hs.pin_value::<Method>(method);
            let receiver = arguments_h.field_at(0);
            let replacement =
                alloc::new_array_of(rt, &[receiver, selector_h.value()])?;
            arguments_h.set(replacement);
            method_h
        }
    };

    let native = match rt.method_cache.probe(method_h.value()) {
        Some(native) => native,
        None => {
            let native = rt.compiler.compile(&rt.globals, method_h.value())?;
            rt.method_cache.update(method_h.value(), native.clone());
            native
        }
    };

    let context = alloc::new_context(
        rt,
        method_h.value(),
        arguments_h.value(),
        caller_h.value(),
    )?;
    let context_h = hs.pin_value::<Context>(context);

    match native(rt, context_h.value())? {
        Control::NonLocal { value, target } if target == context_h.value() => {
            Ok(Control::Normal(value))
        }
        outcome => Ok(outcome),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{alloc, primitives, special};
    use bytecode::BytecodeBuilder;
    use heap::MemoryConfig;

    fn install_small_int_plus(rt: &mut Runtime) {
        let mut b = BytecodeBuilder::new();
        b.push_argument(0);
        b.push_argument(1);
        b.do_primitive(2, primitives::numbers::ADD);
        b.stack_return();
        let small_int_class = rt.globals.small_int_class;
        special::install_method(rt, small_int_class, "+", &[], b.as_bytes(), 0, 4)
            .expect("install +");
    }

    fn send_plus(rt: &mut Runtime, a: i32, b: i32) -> ExecResult {
        let selector = rt.globals.binary_selectors[2];
        let nil = rt.globals.nil;
        let arguments =
            alloc::new_array_of(rt, &[Value::from_int(a), Value::from_int(b)])
                .expect("args");
        send_message(rt, nil, selector, arguments, None)
    }

    #[test]
    fn repeated_sends_hit_the_method_cache() {
        let mut rt = special::bootstrap(MemoryConfig::default());
        install_small_int_plus(&mut rt);

        for _ in 0..1000 {
            let result = send_plus(&mut rt, 1, 1).expect("send +");
            assert_eq!(result, Control::Normal(Value::from_int(2)));
        }

        let stats = rt.method_cache.stats();
        assert_eq!(stats.misses, 1, "only the first send may miss");
        assert_eq!(stats.hits, 999);
        assert_eq!(rt.compiler.methods_compiled(), 1);
    }

    #[test]
    fn dispatch_result_is_identical_cold_and_warm() {
        let mut rt = special::bootstrap(MemoryConfig::default());
        install_small_int_plus(&mut rt);

        let cold = send_plus(&mut rt, 20, 22).expect("cold send");
        let warm = send_plus(&mut rt, 20, 22).expect("warm send");
        assert_eq!(cold, warm);
        assert_eq!(cold, Control::Normal(Value::from_int(42)));
    }

    #[test]
    fn unknown_selector_reaches_does_not_understand() {
        let mut rt = special::bootstrap(MemoryConfig::default());

        let object_class = unsafe { rt.globals.array_class.as_ref::<Class>() }.parent;
        let class = special::install_class(&mut rt, "Plain", object_class);

        // doesNotUnderstand: answers its replaced argument array:
        // [receiver, failed selector].
        let mut b = BytecodeBuilder::new();
        b.push_argument(0);
        b.push_argument(1);
        b.mark_arguments(2);
        b.stack_return();
        special::install_method(
            &mut rt,
            class,
            "doesNotUnderstand:",
            &[],
            b.as_bytes(),
            0,
            4,
        )
        .expect("install dnu");

        let instance = alloc::new_ordinary_object(&mut rt, class, 0).expect("instance");
        let foo = rt.intern("foo");
        let nil = rt.globals.nil;
        let arguments = alloc::new_array_of(&mut rt, &[instance]).expect("args");
        let result = send_message(&mut rt, nil, foo, arguments, None).expect("dnu send");

        let Control::Normal(array) = result else {
            panic!("expected a normal return");
        };
        let fields: &RawObject = unsafe { array.as_ref() };
        assert_eq!(fields.slot_count(), 2);
        assert_eq!(fields.field_at(0), instance);
        assert_eq!(fields.field_at(1), foo);
    }

    #[test]
    fn missing_does_not_understand_is_fatal() {
        let mut rt = special::bootstrap(MemoryConfig::default());
        let object_class = unsafe { rt.globals.array_class.as_ref::<Class>() }.parent;
        let class = special::install_class(&mut rt, "Mute", object_class);

        let instance = alloc::new_ordinary_object(&mut rt, class, 0).expect("instance");
        let bar = rt.intern("bar");
        let nil = rt.globals.nil;
        let arguments = alloc::new_array_of(&mut rt, &[instance]).expect("args");
        let err = send_message(&mut rt, nil, bar, arguments, None).unwrap_err();
        assert_eq!(
            err,
            RuntimeError::NoDoesNotUnderstand { selector: String::from("bar") }
        );
    }

    #[test]
    fn cache_entries_stay_coherent_across_collections() {
        let mut rt = special::bootstrap(MemoryConfig::default());
        install_small_int_plus(&mut rt);

        send_plus(&mut rt, 1, 2).expect("warm up");
        rt.collect_garbage();

        // Every cached method still points at a live, well-formed
        // method object after the flip.
        for method in rt.method_cache.live_methods() {
            assert!(method.is_ref());
            let m: &Method = unsafe { method.as_ref() };
            assert!(!m.header.size.is_relocated());
            assert_eq!(rt.symbol_text(m.name), "+");
        }

        // And the memoized compiler honors compile-at-most-once even
        // though relocation changed every cache index.
        send_plus(&mut rt, 2, 3).expect("post-collection send");
        assert_eq!(rt.compiler.methods_compiled(), 1);
    }

    #[test]
    fn super_sends_use_the_explicit_receiver_class() {
        let mut rt = special::bootstrap(MemoryConfig::default());
        let object_class = unsafe { rt.globals.array_class.as_ref::<Class>() }.parent;
        let parent = special::install_class(&mut rt, "Base", object_class);
        let child = special::install_class(&mut rt, "Derived", parent);

        let mut base_body = BytecodeBuilder::new();
        base_body.push_constant(1);
        base_body.stack_return();
        special::install_method(&mut rt, parent, "who", &[], base_body.as_bytes(), 0, 2)
            .expect("install base");

        let mut child_body = BytecodeBuilder::new();
        child_body.push_constant(2);
        child_body.stack_return();
        special::install_method(&mut rt, child, "who", &[], child_body.as_bytes(), 0, 2)
            .expect("install child");

        let instance = alloc::new_ordinary_object(&mut rt, child, 0).expect("instance");
        let who = rt.intern("who");
        let nil = rt.globals.nil;

        let arguments = alloc::new_array_of(&mut rt, &[instance]).expect("args");
        let normal =
            send_message(&mut rt, nil, who, arguments, None).expect("normal send");
        assert_eq!(normal, Control::Normal(Value::from_int(2)));

        let arguments = alloc::new_array_of(&mut rt, &[instance]).expect("args");
        let explicit = send_message(&mut rt, nil, who, arguments, Some(parent))
            .expect("super send");
        assert_eq!(explicit, Control::Normal(Value::from_int(1)));
    }
}
