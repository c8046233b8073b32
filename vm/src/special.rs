//! Bootstrap of a minimal object world without an image file: the core
//! classes, the singletons, and the pre-interned selectors. Used by the
//! test suites and by hosts embedding the runtime without a snapshot.

use heap::{HandleSet, MemoryConfig, ObjectMemory};
use object::{
    class_of, Class, Dictionary, Globals, RawObject, Value, CLASS_SLOTS,
    DICTIONARY_SLOTS,
};

use crate::{alloc, Runtime, RuntimeError};

/// Build a runtime with a bootstrapped globals record. Everything the
/// bootstrap creates lives in the static heap.
pub fn bootstrap(config: MemoryConfig) -> Runtime {
    let mut memory = ObjectMemory::new(config).expect("memory config");

    // The class of classes; its class slot points at itself.
    let class_class = alloc::static_slot_object(&mut memory, Value::NULL, CLASS_SLOTS);
    unsafe {
        (*class_class.as_ptr::<Class>()).header.class = class_class;
    }

    let new_class = |memory: &mut ObjectMemory| {
        alloc::static_slot_object(memory, class_class, CLASS_SLOTS)
    };
    let object_class = new_class(&mut memory);
    let undefined_class = new_class(&mut memory);
    let true_class = new_class(&mut memory);
    let false_class = new_class(&mut memory);
    let small_int_class = new_class(&mut memory);
    let array_class = new_class(&mut memory);
    let block_class = new_class(&mut memory);
    let context_class = new_class(&mut memory);
    let string_class = new_class(&mut memory);
    let integer_class = new_class(&mut memory);

    let nil = alloc::static_slot_object(&mut memory, undefined_class, 0);
    let true_obj = alloc::static_slot_object(&mut memory, true_class, 0);
    let false_obj = alloc::static_slot_object(&mut memory, false_class, 0);
    let empty_array = alloc::static_slot_object(&mut memory, array_class, 0);

    let symbol = |memory: &mut ObjectMemory, name: &str| {
        alloc::static_byte_object(memory, string_class, name.as_bytes())
    };

    let classes: [(&str, Value, Value); 11] = [
        ("Class", class_class, object_class),
        ("Object", object_class, nil),
        ("UndefinedObject", undefined_class, object_class),
        ("True", true_class, object_class),
        ("False", false_class, object_class),
        ("SmallInt", small_int_class, object_class),
        ("Array", array_class, object_class),
        ("Block", block_class, object_class),
        ("Context", context_class, object_class),
        ("String", string_class, object_class),
        ("Integer", integer_class, object_class),
    ];
    for (name, class, parent) in classes {
        let name_symbol = symbol(&mut memory, name);
        let methods =
            alloc::static_slot_object(&mut memory, object_class, DICTIONARY_SLOTS);
        unsafe {
            let dict = &mut *methods.as_ptr::<Dictionary>();
            dict.keys = empty_array;
            dict.values = empty_array;
            let c = &mut *class.as_ptr::<Class>();
            c.name = name_symbol;
            c.parent = parent;
            c.methods = methods;
            c.instance_size = Value::from_int(0);
            c.variables = empty_array;
        }
    }

    let globals_dict =
        alloc::static_slot_object(&mut memory, object_class, DICTIONARY_SLOTS);
    unsafe {
        let dict = &mut *globals_dict.as_ptr::<Dictionary>();
        dict.keys = empty_array;
        dict.values = empty_array;
    }

    let less = symbol(&mut memory, "<");
    let less_equal = symbol(&mut memory, "<=");
    let plus = symbol(&mut memory, "+");
    let does_not_understand = symbol(&mut memory, "doesNotUnderstand:");

    let globals = Globals {
        nil,
        true_obj,
        false_obj,
        small_int_class,
        array_class,
        block_class,
        context_class,
        string_class,
        integer_class,
        globals_dict,
        initial_method: nil,
        binary_selectors: [less, less_equal, plus],
        does_not_understand,
    };

    let mut rt = Runtime::new(memory, globals);
    rt.intern_table.insert("<".into(), less);
    rt.intern_table.insert("<=".into(), less_equal);
    rt.intern_table.insert("+".into(), plus);
    rt.intern_table
        .insert("doesNotUnderstand:".into(), does_not_understand);
    rt
}

/// Define a new class under `parent`. The class object and its method
/// dictionary live in the static heap; dictionary contents are built in
/// the movable heap and registered through the write barrier.
pub fn install_class(rt: &mut Runtime, name: &str, parent: Value) -> Value {
    let class_class = class_of(rt.globals.array_class, &rt.globals);
    let name_symbol = rt.intern(name);

    let (object_class, empty) = unsafe {
        let array: &Class = rt.globals.array_class.as_ref();
        (array.parent, array.variables)
    };
    let class = alloc::static_slot_object(&mut rt.memory, class_class, CLASS_SLOTS);
    let methods =
        alloc::static_slot_object(&mut rt.memory, object_class, DICTIONARY_SLOTS);
    unsafe {
        let dict = &mut *methods.as_ptr::<Dictionary>();
        dict.keys = empty;
        dict.values = empty;
        let c = &mut *class.as_ptr::<Class>();
        c.name = name_symbol;
        c.parent = parent;
        c.methods = methods;
        c.instance_size = Value::from_int(0);
        c.variables = empty;
    }
    class
}

/// Compile-and-install: build a method object and insert it into the
/// class's method dictionary under `selector`.
pub fn install_method(
    rt: &mut Runtime,
    class: Value,
    selector: &str,
    literals: &[Value],
    byte_codes: &[u8],
    temporary_size: i32,
    stack_size: i32,
) -> Result<Value, RuntimeError> {
    let symbol = rt.intern(selector);
    let method = alloc::new_method(
        rt,
        symbol,
        class,
        literals,
        byte_codes,
        temporary_size,
        stack_size,
    )?;

    let hs = HandleSet::new(&mut rt.memory);
    let method_h = hs.pin_value::<RawObject>(method);
    let symbol_h = hs.pin_value::<RawObject>(symbol);

    let dictionary = unsafe { class.as_ref::<Class>() }.methods;

    // Dictionaries grow by replacement: fresh key/value arrays with the
    // new entry appended.
    let mut keys: Vec<Value> = {
        let dict: &Dictionary = unsafe { dictionary.as_ref() };
        unsafe { dict.keys.as_ref::<RawObject>() }.fields().to_vec()
    };
    keys.push(symbol_h.value());
    let new_keys = alloc::new_array_of(rt, &keys)?;
    let new_keys_h = hs.pin_value::<RawObject>(new_keys);

    let mut values: Vec<Value> = {
        let dict: &Dictionary = unsafe { dictionary.as_ref() };
        unsafe { dict.values.as_ref::<RawObject>() }.fields().to_vec()
    };
    values.push(method_h.value());
    let new_values = alloc::new_array_of(rt, &values)?;

    unsafe {
        let dict = &mut *dictionary.as_ptr::<Dictionary>();
        dict.keys = new_keys_h.value();
        rt.memory
            .check_root(dict.keys, &mut dict.keys as *mut Value);
        dict.values = new_values;
        rt.memory
            .check_root(dict.values, &mut dict.values as *mut Value);
    }
    Ok(method_h.value())
}
