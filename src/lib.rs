#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;
pub use error::{KilnError, KilnIoError, Result};

pub mod signature;
pub use signature::{
    file_content_signature, file_signature, file_time_signature, stable_hash, Signature,
    SignatureHasher,
};

pub mod entity;
pub use entity::{Entity, EntityClass, EntityId, Tags};

pub mod lock;
pub use lock::{FileLock, FileLockGuard};

pub mod vfile;
pub use vfile::VFile;

pub mod builder;
pub use builder::{AnyNode, Builder, MakeValue, RawValue};

pub mod node;
pub use node::{
    BatchNode, Node, NodeRef, NodeTargetsFilter, NodeValue, Source, TargetUpdate,
};

pub mod events;
pub use events::{EventSink, LogEventSink};

pub mod report;
pub use report::{BuildStrArgs, StrArg};

pub mod utils;
