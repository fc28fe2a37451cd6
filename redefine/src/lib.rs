#![warn(clippy::pedantic)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
// Pool indices, idnums and cache indices are all u16, and are checked before narrowing.
#![allow(clippy::cast_possible_truncation)]

pub mod class;
pub mod compare;
pub mod config;
pub mod cpcache;
pub mod emcp;
pub mod error;
pub mod frames;
pub mod lock;
pub mod method;
pub mod pool_merge;
mod reconstitute;
pub mod redefine;
pub mod rewrite;
pub mod runtime;
pub mod safepoint;
pub mod translation;

pub use class::{ClassVersion, LoadedClass, VersionHistory};
pub use config::{MethodChangePolicy, RedefineConfig};
pub use cpcache::CallSiteCache;
pub use error::{BatchError, LinkageError, MethodChange, RedefineError, SchemaChange};
pub use method::{Method, MethodState};
pub use pool_merge::{merge_constant_pools, MergeResult};
pub use redefine::{
    ClassReport, RedefinitionEvent, RedefinitionListener, RedefinitionPhase, RedefinitionReport,
    RedefinitionRequest,
};
pub use runtime::Runtime;
pub use translation::TranslationMap;
