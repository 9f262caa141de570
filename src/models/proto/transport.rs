//////////////////////////////////////////////////////////////////////////////
// Object Transport //////////////////////////////////////////////////////////

/// The header of an object sent over a transport stream.
///
/// The header is followed on the wire by exactly `attrs.size` bytes of object body.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ObjHeader {
    /// The bucket of the object.
    #[prost(message, optional, tag = "1")]
    pub bucket: ::core::option::Option<super::object::Bucket>,
    /// The name of the object.
    #[prost(string, tag = "2")]
    pub obj_name: ::prost::alloc::string::String,
    /// The attributes of the object.
    #[prost(message, optional, tag = "3")]
    pub attrs: ::core::option::Option<super::object::ObjAttrs>,
    /// An opaque token interpreted only by the receiver.
    #[prost(bytes = "vec", tag = "4")]
    pub opaque: ::prost::alloc::vec::Vec<u8>,
    /// The operation this header represents.
    #[prost(enumeration = "Opcode", tag = "5")]
    pub opcode: i32,
    /// The ID of the sending node.
    #[prost(string, tag = "6")]
    pub sender: ::prost::alloc::string::String,
    /// An error message attached to control opcodes.
    #[prost(string, tag = "7")]
    pub error: ::prost::alloc::string::String,
}
/// The operation of an object header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Opcode {
    /// The header is followed by an object body.
    Data = 0,
    /// The sender has finished contributing to the archive named by the opaque token.
    ArchiveDone = 1,
}
