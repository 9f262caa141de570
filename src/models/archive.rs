use crate::models::Bucket;

/// The only archive format currently supported.
pub const EXT_TAR: &str = ".tar";

/// A request to build an archive out of objects of a source bucket.
#[derive(Clone, Debug, PartialEq)]
pub struct ArchiveMsg {
    /// The bucket holding the constituent objects.
    pub from_bucket: Bucket,
    /// The bucket in which the archive object is to be created.
    pub to_bucket: Bucket,
    /// The name of the archive object.
    pub arch_name: String,
    /// The constituents of the archive.
    pub list_range: ListRange,
}

/// The constituent spec of an archive request.
#[derive(Clone, Debug, PartialEq)]
pub enum ListRange {
    /// An explicit list of object names.
    ///
    /// Any constituent failure, including non-existence, fails the archive.
    List(Vec<String>),
    /// A brace template such as `shard-{0001..0100}.bin`, or a plain name prefix when the
    /// template has no braces.
    ///
    /// Missing or failing constituents are skipped.
    Range(String),
}

impl ArchiveMsg {
    /// The unique name of the archive, used as its placement key & correlation token.
    pub fn full_name(&self) -> String {
        self.to_bucket.make_uname(&self.arch_name)
    }

    /// Check if this request names its constituents explicitly.
    pub fn is_list(&self) -> bool {
        matches!(self.list_range, ListRange::List(_))
    }
}
