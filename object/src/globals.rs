use crate::Value;

/// The process-wide globals record: singletons, core classes, the
/// globals dictionary, the initial method, and the pre-interned
/// selectors.
///
/// All fields are filled by the image loader (or the test bootstrap) and
/// enumerated for rooting through [`Globals::visit`].
#[derive(Debug, Clone, Copy)]
pub struct Globals {
    pub nil: Value,
    pub true_obj: Value,
    pub false_obj: Value,
    pub small_int_class: Value,
    pub array_class: Value,
    pub block_class: Value,
    pub context_class: Value,
    pub string_class: Value,
    pub integer_class: Value,
    pub globals_dict: Value,
    pub initial_method: Value,
    /// `<`, `<=`, `+` in that order.
    pub binary_selectors: [Value; 3],
    /// The `doesNotUnderstand:` selector.
    pub does_not_understand: Value,
}

impl Globals {
    /// An all-null record, to be filled field by field during load.
    pub fn empty() -> Self {
        Self {
            nil: Value::NULL,
            true_obj: Value::NULL,
            false_obj: Value::NULL,
            small_int_class: Value::NULL,
            array_class: Value::NULL,
            block_class: Value::NULL,
            context_class: Value::NULL,
            string_class: Value::NULL,
            integer_class: Value::NULL,
            globals_dict: Value::NULL,
            initial_method: Value::NULL,
            binary_selectors: [Value::NULL; 3],
            does_not_understand: Value::NULL,
        }
    }

    /// Enumerate every field for root visiting.
    pub fn visit(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        visitor(&mut self.nil);
        visitor(&mut self.true_obj);
        visitor(&mut self.false_obj);
        visitor(&mut self.small_int_class);
        visitor(&mut self.array_class);
        visitor(&mut self.block_class);
        visitor(&mut self.context_class);
        visitor(&mut self.string_class);
        visitor(&mut self.integer_class);
        visitor(&mut self.globals_dict);
        visitor(&mut self.initial_method);
        for sel in self.binary_selectors.iter_mut() {
            visitor(sel);
        }
        visitor(&mut self.does_not_understand);
    }
}

/// Class of a value: the small-integer class for tagged integers,
/// otherwise the object's class slot.
#[inline(always)]
pub fn class_of(value: Value, globals: &Globals) -> Value {
    if value.is_int() {
        globals.small_int_class
    } else {
        unsafe { value.as_ref::<crate::RawObject>() }.header.class
    }
}
