//! Image snapshot loading and storing.
//!
//! The stream is a sequence of tagged records (all multi-byte integers
//! big-endian). Top-level records appear in globals order, the nil
//! object first; every materialized object occupies one load-table
//! entry that back-reference records index, so shared subgraphs and
//! cycles load with identity preserved. Objects materialize in the
//! static heap — the initial graph is long-lived and loading never
//! triggers a collection mid-record.

use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter, Read, Write};

use heap::ObjectMemory;
use object::{
    allocation_size, ByteObject, Globals, Header, RawObject, Value, HEADER_BYTES,
};

const TAG_INVALID: u8 = 0;
const TAG_ORDINARY: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_BYTES: u8 = 3;
const TAG_PREVIOUS: u8 = 4;
const TAG_NIL: u8 = 5;

/// Number of top-level records: the globals in field order, with the
/// three binary selectors written individually.
const ROOT_COUNT: usize = 15;

pub fn load_image<R: Read>(memory: &mut ObjectMemory, reader: R) -> io::Result<Globals> {
    let mut loader = Loader {
        memory,
        reader: BufReader::new(reader),
        table: Vec::new(),
        nil: Value::NULL,
        fixups: Vec::new(),
    };

    let mut roots = [Value::NULL; ROOT_COUNT];
    for (i, root) in roots.iter_mut().enumerate() {
        *root = match loader.read_object()? {
            Loaded::Ready(value) => value,
            Loaded::PendingNil | Loaded::PendingIndex(_) => {
                return Err(invalid_data("top-level record is unresolved"));
            }
        };
        if i == 0 {
            loader.nil = *root;
        }
    }
    loader.apply_fixups()?;

    if roots.iter().any(|r| !r.is_ref()) {
        return Err(invalid_data("image does not define every global"));
    }

    Ok(Globals {
        nil: roots[0],
        true_obj: roots[1],
        false_obj: roots[2],
        small_int_class: roots[3],
        array_class: roots[4],
        block_class: roots[5],
        context_class: roots[6],
        string_class: roots[7],
        integer_class: roots[8],
        globals_dict: roots[9],
        initial_method: roots[10],
        binary_selectors: [roots[11], roots[12], roots[13]],
        does_not_understand: roots[14],
    })
}

pub fn store_image<W: Write>(globals: &Globals, writer: W) -> io::Result<()> {
    let mut storer = Storer {
        writer: BufWriter::new(writer),
        written: HashMap::new(),
        nil: globals.nil,
    };

    // Nil leads the stream as a full record; later nil references
    // collapse to nil-reference records.
    storer.write_full(globals.nil)?;
    let rest = [
        globals.true_obj,
        globals.false_obj,
        globals.small_int_class,
        globals.array_class,
        globals.block_class,
        globals.context_class,
        globals.string_class,
        globals.integer_class,
        globals.globals_dict,
        globals.initial_method,
        globals.binary_selectors[0],
        globals.binary_selectors[1],
        globals.binary_selectors[2],
        globals.does_not_understand,
    ];
    for root in rest {
        storer.write_object(root)?;
    }
    storer.writer.flush()
}

/// Result of reading one record. A reference can be pending when it
/// points at the not-yet-materialized nil object or at a load-table
/// entry still being read (a cycle); the slot is patched afterwards.
#[derive(Clone, Copy)]
enum Loaded {
    Ready(Value),
    PendingNil,
    PendingIndex(usize),
}

enum FixupSource {
    Nil,
    Table(usize),
}

struct Loader<'a, R: Read> {
    memory: &'a mut ObjectMemory,
    reader: BufReader<R>,
    table: Vec<Value>,
    nil: Value,
    fixups: Vec<(*mut Value, FixupSource)>,
}

impl<R: Read> Loader<'_, R> {
    fn read_u8(&mut self) -> io::Result<u8> {
        let mut byte = [0u8; 1];
        self.reader.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    fn read_u32(&mut self) -> io::Result<u32> {
        let mut word = [0u8; 4];
        self.reader.read_exact(&mut word)?;
        Ok(u32::from_be_bytes(word))
    }

    fn read_i32(&mut self) -> io::Result<i32> {
        let mut word = [0u8; 4];
        self.reader.read_exact(&mut word)?;
        Ok(i32::from_be_bytes(word))
    }

    fn store(&mut self, loaded: Loaded, slot: *mut Value) {
        match loaded {
            Loaded::Ready(value) => unsafe { *slot = value },
            Loaded::PendingNil => {
                unsafe { *slot = Value::NULL };
                self.fixups.push((slot, FixupSource::Nil));
            }
            Loaded::PendingIndex(index) => {
                unsafe { *slot = Value::NULL };
                self.fixups.push((slot, FixupSource::Table(index)));
            }
        }
    }

    fn read_object(&mut self) -> io::Result<Loaded> {
        match self.read_u8()? {
            TAG_ORDINARY => {
                // Reserve the table entry before the class record: a
                // cyclic class reference resolves to this index.
                let index = self.table.len();
                self.table.push(Value::NULL);

                let class = self.read_object()?;
                let count = self.read_u32()? as usize;
                let payload = count * core::mem::size_of::<Value>();
                let ptr = self.memory.static_allocate(allocation_size(payload));
                unsafe {
                    (ptr.as_ptr() as *mut Header)
                        .write(Header::new(payload, false, Value::NULL));
                }
                let header = unsafe { &mut *(ptr.as_ptr() as *mut Header) };
                self.store(class, &mut header.class as *mut Value);

                let value = Value::from_ptr(ptr.as_ptr());
                self.table[index] = value;

                let fields = unsafe { ptr.as_ptr().add(HEADER_BYTES) as *mut Value };
                for i in 0..count {
                    let field = self.read_object()?;
                    self.store(field, unsafe { fields.add(i) });
                }
                Ok(Loaded::Ready(value))
            }
            TAG_INT => Ok(Loaded::Ready(Value::from_int(self.read_i32()?))),
            TAG_BYTES => {
                let index = self.table.len();
                self.table.push(Value::NULL);

                let class = self.read_object()?;
                let count = self.read_u32()? as usize;
                let ptr = self.memory.static_allocate(allocation_size(count));
                unsafe {
                    (ptr.as_ptr() as *mut Header)
                        .write(Header::new(count, true, Value::NULL));
                }
                let header = unsafe { &mut *(ptr.as_ptr() as *mut Header) };
                self.store(class, &mut header.class as *mut Value);

                let value = Value::from_ptr(ptr.as_ptr());
                self.table[index] = value;

                let bytes = unsafe {
                    core::slice::from_raw_parts_mut(ptr.as_ptr().add(HEADER_BYTES), count)
                };
                self.reader.read_exact(bytes)?;
                Ok(Loaded::Ready(value))
            }
            TAG_PREVIOUS => {
                let index = self.read_u32()? as usize;
                match self.table.get(index) {
                    Some(value) if value.is_ref() => Ok(Loaded::Ready(*value)),
                    Some(_) => Ok(Loaded::PendingIndex(index)),
                    None => Err(invalid_data("back-reference outside the load table")),
                }
            }
            TAG_NIL => {
                if self.nil.is_ref() {
                    Ok(Loaded::Ready(self.nil))
                } else {
                    Ok(Loaded::PendingNil)
                }
            }
            TAG_INVALID => Err(invalid_data("invalid object record")),
            _ => Err(invalid_data("unknown record tag")),
        }
    }

    fn apply_fixups(&mut self) -> io::Result<()> {
        for (slot, source) in self.fixups.drain(..) {
            let value = match source {
                FixupSource::Nil => self.nil,
                FixupSource::Table(index) => self.table[index],
            };
            if !value.is_ref() {
                return Err(invalid_data("unresolved reference in image"));
            }
            unsafe { *slot = value };
        }
        Ok(())
    }
}

struct Storer<W: Write> {
    writer: BufWriter<W>,
    /// Object address → load-table index, mirroring the loader's table.
    written: HashMap<u64, u32>,
    nil: Value,
}

impl<W: Write> Storer<W> {
    fn write_u8(&mut self, byte: u8) -> io::Result<()> {
        self.writer.write_all(&[byte])
    }

    fn write_u32(&mut self, word: u32) -> io::Result<()> {
        self.writer.write_all(&word.to_be_bytes())
    }

    /// Emit the minimal record for `value`: inline integer, nil
    /// reference, back-reference, or a full record for the first
    /// encounter.
    fn write_object(&mut self, value: Value) -> io::Result<()> {
        if value.is_int() {
            self.write_u8(TAG_INT)?;
            return self
                .writer
                .write_all(&unsafe { value.to_int() }.to_be_bytes());
        }
        if value == self.nil {
            return self.write_u8(TAG_NIL);
        }
        if let Some(&index) = self.written.get(&value.addr()) {
            self.write_u8(TAG_PREVIOUS)?;
            return self.write_u32(index);
        }
        self.write_full(value)
    }

    fn write_full(&mut self, value: Value) -> io::Result<()> {
        // The table index is claimed before the class record, matching
        // the loader; a class cycle becomes a back-reference to it.
        let index = self.written.len() as u32;
        self.written.insert(value.addr(), index);

        let header = unsafe { &value.as_ref::<RawObject>().header };
        if header.size.is_binary() {
            self.write_u8(TAG_BYTES)?;
            self.write_object(header.class)?;
            let bytes: &ByteObject = unsafe { value.as_ref() };
            self.write_u32(bytes.len() as u32)?;
            self.writer.write_all(bytes.bytes())
        } else {
            self.write_u8(TAG_ORDINARY)?;
            self.write_object(header.class)?;
            let object: &RawObject = unsafe { value.as_ref() };
            self.write_u32(object.slot_count() as u32)?;
            for i in 0..object.slot_count() {
                self.write_object(object.field_at(i))?;
            }
            Ok(())
        }
    }
}

fn invalid_data(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::special;
    use heap::MemoryConfig;
    use object::{class_of, Class};

    fn round_trip(rt: &crate::Runtime) -> Globals {
        let mut buffer = Vec::new();
        store_image(&rt.globals, &mut buffer).expect("store");

        let mut memory = ObjectMemory::new(MemoryConfig::default()).expect("config");
        load_image(&mut memory, buffer.as_slice()).expect("load")
    }

    #[test]
    fn round_trip_preserves_the_object_graph() {
        let rt = special::bootstrap(MemoryConfig::default());
        let restored = round_trip(&rt);

        // Distinct singletons, correctly classed.
        assert_ne!(restored.nil, restored.true_obj);
        assert_ne!(restored.true_obj, restored.false_obj);

        // The class chain is intact: Array -> Object -> nil.
        let array: &Class = unsafe { restored.array_class.as_ref() };
        let object: &Class = unsafe { array.parent.as_ref() };
        assert_eq!(object.parent, restored.nil);

        // Selector contents survive.
        let plus: &ByteObject = unsafe { restored.binary_selectors[2].as_ref() };
        assert_eq!(plus.bytes(), b"+");
        let dnu: &ByteObject = unsafe { restored.does_not_understand.as_ref() };
        assert_eq!(dnu.bytes(), b"doesNotUnderstand:");
    }

    #[test]
    fn round_trip_preserves_identity_of_shared_objects() {
        let rt = special::bootstrap(MemoryConfig::default());
        let restored = round_trip(&rt);

        // Object appears in every class chain; all paths must converge
        // on one object.
        let via_array = unsafe { restored.array_class.as_ref::<Class>() }.parent;
        let via_block = unsafe { restored.block_class.as_ref::<Class>() }.parent;
        let via_string = unsafe { restored.string_class.as_ref::<Class>() }.parent;
        assert_eq!(via_array, via_block);
        assert_eq!(via_block, via_string);

        // The class-of-classes cycle closes on itself.
        let class_class = class_of(restored.array_class, &restored);
        assert_eq!(class_of(class_class, &restored), class_class);

        // Nil references inside the nil object's own class subgraph
        // resolve to the nil object itself.
        let undefined: &Class = unsafe { class_of(restored.nil, &restored).as_ref() };
        let object: &Class = unsafe { undefined.parent.as_ref() };
        assert_eq!(object.parent, restored.nil, "Object's superclass is nil");
    }

    #[test]
    fn tagged_integers_store_inline() {
        let mut rt = special::bootstrap(MemoryConfig::default());
        // Stash an integer in a class's instance_size slot and verify it
        // survives the trip.
        let nil = rt.globals.nil;
        let class = special::install_class(&mut rt, "Probe", nil);
        unsafe {
            (*class.as_ptr::<Class>()).instance_size = Value::from_int(-12345);
        }
        rt.globals.initial_method = class;

        let restored = round_trip(&rt);
        let probe: &Class = unsafe { restored.initial_method.as_ref() };
        assert_eq!(unsafe { probe.instance_size.to_int() }, -12345);
    }

    #[test]
    fn malformed_images_are_rejected() {
        let mut memory = ObjectMemory::new(MemoryConfig::default()).expect("config");
        // Tag 0 terminates with an error.
        let err = load_image(&mut memory, [TAG_INVALID].as_slice()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        // A back-reference outside the table is rejected.
        let bogus = [TAG_PREVIOUS, 0, 0, 0, 9];
        let err = load_image(&mut memory, bogus.as_slice()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        // A truncated stream surfaces as an I/O error.
        let truncated = [TAG_ORDINARY];
        assert!(load_image(&mut memory, truncated.as_slice()).is_err());
    }
}
