//! Error types of the store layers, one enum per layer.
//!
//! Each enum wraps the error of the layer below it, so `?` moves failures up
//! the stack without manual conversion.

use bstore_api::error::APIError;
use thiserror::Error;

///Error type used in the block layer
#[derive(Error, Debug)]
pub enum BlockError {
    ///errors from the device controller and block primitives
    #[error("error in the api layer")]
    Api(#[from] APIError),

    ///errors regarding input to the block store
    #[error("invalid block store input: {0}")]
    Input(&'static str),

    ///errors regarding the on-disk state of the store file
    #[error("block store format violation: {0}")]
    Format(&'static str),
}

///Error type used in the record layer
#[derive(Error, Debug)]
pub enum RecordError {
    ///errors from the block layer
    #[error("error in the block layer")]
    Block(#[from] BlockError),

    ///errors from block header and content primitives
    #[error("error in the api layer")]
    Api(#[from] APIError),

    ///errors regarding input to the record store
    #[error("invalid record store input: {0}")]
    Input(&'static str),

    ///errors regarding the on-disk shape of record chains and the free list
    #[error("record store format violation: {0}")]
    Format(&'static str),

    ///the caller-supplied payload generator failed
    #[error("record payload generation failed")]
    Payload(#[source] APIError),
}

///Error type used in the tree layers
#[derive(Error, Debug)]
pub enum TreeError {
    ///errors from the record layer
    #[error("error in the record layer")]
    Record(#[from] RecordError),

    ///errors from the node codec
    #[error("error in the node codec")]
    Api(#[from] APIError),

    ///an insert found its key already present in a unique tree
    #[error("key already exists in a unique tree")]
    KeyExists,

    ///the requested operation is not available on this tree
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    ///errors regarding the stored shape of the tree
    #[error("tree format violation: {0}")]
    Format(&'static str),
}

///Error type used at the database boundary
#[derive(Error, Debug)]
pub enum DbError {
    ///errors from the index layer
    #[error("error in the index layer")]
    Tree(#[from] TreeError),

    ///errors from the record layer
    #[error("error in the record layer")]
    Record(#[from] RecordError),

    ///errors from the device controller
    #[error("error in the api layer")]
    Api(#[from] APIError),

    ///errors from row (de)serialization
    #[error("row serialization failed")]
    Serialize(#[from] bincode::Error),

    ///the addressed row does not exist
    #[error("row not found")]
    NotFound,

    ///an insert found its row id already present
    #[error("row id already exists")]
    KeyExists,

    ///errors regarding input to the database
    #[error("invalid database input: {0}")]
    Input(&'static str),
}
