//! Data models.

pub mod archive;
pub mod proto;

use std::fmt;

pub use proto::object::{Bucket, BucketRecord, ObjAttrs, Provider};
pub use proto::transport::{ObjHeader, Opcode};

/// The checksum type used for objects written by this node.
pub const CHECKSUM_SEAHASH: &str = "seahash";

impl Bucket {
    /// Create a new bucket reference.
    pub fn new(provider: Provider, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: provider as i32,
        }
    }

    /// Check if this bucket is backed by a remote store.
    pub fn is_remote(&self) -> bool {
        self.provider() == Provider::Cloud
    }

    /// The unique name of this bucket, `{provider}/{name}`.
    pub fn uname(&self) -> String {
        format!("{}/{}", self.provider().as_str(), self.name)
    }

    /// The unique name of an object within this bucket, `{provider}/{name}/{obj_name}`.
    ///
    /// This value is the placement key of the object.
    pub fn make_uname(&self, obj_name: &str) -> String {
        format!("{}/{}/{}", self.provider().as_str(), self.name, obj_name)
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.provider().as_str(), self.name)
    }
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Hadron => "hdn",
            Provider::Cloud => "cloud",
        }
    }
}

impl ObjHeader {
    /// The size of the body which follows this header.
    pub fn size(&self) -> u64 {
        self.attrs.as_ref().map(|attrs| attrs.size).unwrap_or(0)
    }

    /// The unique name of the object of this header.
    pub fn full_name(&self) -> String {
        match &self.bucket {
            Some(bucket) => bucket.make_uname(&self.obj_name),
            None => self.obj_name.clone(),
        }
    }
}
