#![warn(clippy::pedantic)]
// The design of this library tends towards this, and grouping them together makes it harder to
// minimize dependencies on the data.
#![allow(clippy::too_many_arguments)]
// Not really useful.
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::similar_names)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::module_name_repetitions)]
// Class files store nearly everything as u16, and we index slices with them constantly.
#![allow(clippy::cast_possible_truncation)]

pub mod access;
pub mod builder;
pub mod class;
pub mod class_file;
pub mod code;
pub mod constant_pool;
pub mod descriptor;
pub mod id;
pub mod symbol;
pub mod verify;

pub use access::{ClassAccessFlags, FieldAccessFlags, MethodAccessFlags};
pub use class::{ClassData, FieldInfo, MethodInfo};
pub use constant_pool::{ConstantEntry, ConstantPool, ConstantPoolError, PoolIndex};
pub use id::{ClassId, MethodIdnum};
pub use symbol::{Symbol, SymbolTable};

/// A map keyed by one of our ids, which are already unique integers.
#[cfg(feature = "implementation-cheaper-map-hashing")]
pub type IdMap<K, V> = std::collections::HashMap<K, V, nohash_hasher::BuildNoHashHasher<K>>;
#[cfg(not(feature = "implementation-cheaper-map-hashing"))]
pub type IdMap<K, V> = std::collections::HashMap<K, V>;

/// A set of one of our ids
#[cfg(feature = "implementation-cheaper-map-hashing")]
pub type IdSet<K> = std::collections::HashSet<K, nohash_hasher::BuildNoHashHasher<K>>;
#[cfg(not(feature = "implementation-cheaper-map-hashing"))]
pub type IdSet<K> = std::collections::HashSet<K>;
