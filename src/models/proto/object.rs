///////////////////////////////////////////////////////////////////////////////
// Components /////////////////////////////////////////////////////////////////

/// A bucket reference.
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct Bucket {
    /// The name of the bucket.
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    /// The storage provider of the bucket.
    #[prost(enumeration = "Provider", tag = "2")]
    pub provider: i32,
}
/// The attributes of a stored object.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ObjAttrs {
    /// The size of the object in bytes.
    #[prost(uint64, tag = "1")]
    pub size: u64,
    /// The last access time of the object, as unix nanoseconds.
    #[prost(int64, tag = "2")]
    pub atime: i64,
    /// The checksum algorithm of `checksum_value`, empty when no checksum applies.
    #[prost(string, tag = "3")]
    pub checksum_type: ::prost::alloc::string::String,
    /// The checksum of the object's content.
    #[prost(string, tag = "4")]
    pub checksum_value: ::prost::alloc::string::String,
    /// The version of the object.
    #[prost(string, tag = "5")]
    pub version: ::prost::alloc::string::String,
}
/// A bucket record as stored on disk.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BucketRecord {
    /// The bucket.
    #[prost(message, optional, tag = "1")]
    pub bucket: ::core::option::Option<Bucket>,
    /// The creation time of the bucket, as unix nanoseconds.
    #[prost(int64, tag = "2")]
    pub created: i64,
}
/// The storage provider of a bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Provider {
    /// Objects are stored only within the cluster.
    Hadron = 0,
    /// Objects are backed by a remote store and may be fetched on demand.
    Cloud = 1,
}
