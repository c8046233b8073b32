//! On-heap object model: tagged values, the common object header, and
//! typed views over heap memory. Shared by the interpreter, the
//! dispatcher, and the collector.

mod globals;
mod header;
mod objects;
mod tagged;
mod value;

pub use globals::{class_of, Globals};
pub use header::{allocation_size, Header, SizeWord, HEADER_BYTES};
pub use objects::{
    Block, ByteObject, Class, Context, Dictionary, Method, RawObject,
    BLOCK_SLOTS, CLASS_SLOTS, CONTEXT_SLOTS, DICTIONARY_SLOTS, METHOD_SLOTS,
};
pub use tagged::Tagged;
pub use value::Value;
