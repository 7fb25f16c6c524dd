//! Serialization of tree nodes into record payloads.
//!
//! A node body is `parent_id u32 | entry_count u32 | child_count u32`
//! followed by the entries and then the child ids, all little-endian. Fixed
//! size keys are written bare; variable keys are prefixed with their i32
//! length. Values must be fixed size. The node id itself is not part of the
//! body: it equals the id of the record holding the node, so deserialization
//! is handed the id to assign.

use bstore_api::codec::Codec;
use bstore_api::error::APIError;
use bstore_api::types::TreeNode;
use bstore_api::util;
use std::convert::TryFrom;
use std::marker::PhantomData;

/// Serialized nodes must stay below this size.
pub const MAX_NODE_BYTES: usize = 64 * 1024;

/// Encoder/decoder pairing a key codec `KC` and a value codec `VC`.
#[derive(Debug)]
pub struct NodeCodec<K, V, KC, VC> {
    _marker: PhantomData<(K, V, KC, VC)>,
}

fn take<'a>(bytes: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], APIError> {
    if *pos + n > bytes.len() {
        return Err(APIError::Codec("node body truncated"));
    }
    let slice = &bytes[*pos..*pos + n];
    *pos += n;
    Ok(slice)
}

impl<K, V, KC, VC> NodeCodec<K, V, KC, VC>
where
    KC: Codec<K>,
    VC: Codec<V>,
{
    /// Build a codec, rejecting combinations with variable-size values.
    pub fn new() -> Result<Self, APIError> {
        if VC::SIZE.is_none() {
            return Err(APIError::Codec(
                "variable-length values are not supported in tree nodes",
            ));
        }
        Ok(NodeCodec {
            _marker: PhantomData,
        })
    }

    /// Serialize `node` into a record payload.
    /// Fails when the serialized form would reach [`MAX_NODE_BYTES`].
    pub fn encode(&self, node: &TreeNode<K, V>) -> Result<Vec<u8>, APIError> {
        let mut out = Vec::new();
        util::push_u32(&mut out, node.parent_id);
        util::push_u32(&mut out, node.entries.len() as u32);
        util::push_u32(&mut out, node.children.len() as u32);
        for (key, value) in &node.entries {
            match KC::SIZE {
                Some(_) => KC::encode(key, &mut out)?,
                None => {
                    let mut key_bytes = Vec::new();
                    KC::encode(key, &mut key_bytes)?;
                    let len = i32::try_from(key_bytes.len())
                        .map_err(|_| APIError::Codec("key encoding too large"))?;
                    util::push_i32(&mut out, len);
                    out.extend_from_slice(&key_bytes);
                }
            }
            VC::encode(value, &mut out)?;
        }
        for child in &node.children {
            util::push_u32(&mut out, *child);
        }
        if out.len() >= MAX_NODE_BYTES {
            return Err(APIError::Codec("serialized node exceeds the maximum node size"));
        }
        Ok(out)
    }

    /// Rebuild a node from a record payload, assigning it `id`.
    pub fn decode(&self, id: u32, bytes: &[u8]) -> Result<TreeNode<K, V>, APIError> {
        let value_size = VC::SIZE.ok_or(APIError::Codec(
            "variable-length values are not supported in tree nodes",
        ))?;
        let mut pos = 0;
        let parent_id = util::read_u32(take(bytes, &mut pos, 4)?, 0)?;
        let entry_count = util::read_u32(take(bytes, &mut pos, 4)?, 0)? as usize;
        let child_count = util::read_u32(take(bytes, &mut pos, 4)?, 0)? as usize;

        let mut entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            let key = match KC::SIZE {
                Some(n) => KC::decode(take(bytes, &mut pos, n)?)?,
                None => {
                    let len = util::read_i32(take(bytes, &mut pos, 4)?, 0)?;
                    let len = usize::try_from(len)
                        .map_err(|_| APIError::Codec("negative key length in node body"))?;
                    KC::decode(take(bytes, &mut pos, len)?)?
                }
            };
            let value = VC::decode(take(bytes, &mut pos, value_size)?)?;
            entries.push((key, value));
        }
        let mut children = Vec::with_capacity(child_count);
        for _ in 0..child_count {
            children.push(util::read_u32(take(bytes, &mut pos, 4)?, 0)?);
        }
        if pos != bytes.len() {
            return Err(APIError::Codec("trailing bytes after node body"));
        }
        Ok(TreeNode::new(id, parent_id, entries, children))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bstore_api::codec::{U32Codec, Utf8Codec};

    #[test]
    fn fixed_layout() {
        let codec = NodeCodec::<u32, u32, U32Codec, U32Codec>::new().unwrap();
        let node = TreeNode::new(9, 3, vec![(10, 100), (20, 200)], vec![4, 5, 6]);
        let bytes = codec.encode(&node).unwrap();
        // prefix | 2 entries of key||value | 3 children
        assert_eq!(bytes.len(), 12 + 2 * 8 + 3 * 4);
        assert_eq!(&bytes[..4], &[3, 0, 0, 0]); //parent
        assert_eq!(&bytes[4..8], &[2, 0, 0, 0]); //entry count
        assert_eq!(&bytes[8..12], &[3, 0, 0, 0]); //child count
        assert_eq!(&bytes[12..16], &[10, 0, 0, 0]); //first key
        assert_eq!(&bytes[16..20], &[100, 0, 0, 0]); //first value

        let back = codec.decode(9, &bytes).unwrap();
        assert_eq!(back, node);
        //the id comes from the caller, not the body
        assert_eq!(codec.decode(77, &bytes).unwrap().id, 77);

        assert!(codec.decode(9, &bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn variable_key_layout() {
        let codec = NodeCodec::<String, u32, Utf8Codec, U32Codec>::new().unwrap();
        let node = TreeNode::new(
            2,
            0,
            vec![
                ("a".to_string(), 1),
                ("bb".to_string(), 2),
                ("日本語".to_string(), 3),
                (String::new(), 4),
                ("ccccc".to_string(), 5),
            ],
            vec![],
        );
        let bytes = codec.encode(&node).unwrap();
        //each entry: 4-byte length + key bytes + 4-byte value
        assert_eq!(&bytes[12..16], &[1, 0, 0, 0]); //len("a")
        assert_eq!(bytes[16], b'a');
        let back = codec.decode(2, &bytes).unwrap();
        assert_eq!(back, node);
        //byte-for-byte stable across a second round trip
        assert_eq!(codec.encode(&back).unwrap(), bytes);
    }

    #[test]
    fn unsupported_and_oversized() {
        assert!(NodeCodec::<String, String, Utf8Codec, Utf8Codec>::new().is_err());

        let codec = NodeCodec::<String, u32, Utf8Codec, U32Codec>::new().unwrap();
        let big_key = "k".repeat(1024);
        let entries: Vec<(String, u32)> = (0..70).map(|i| (big_key.clone(), i)).collect();
        let node = TreeNode::new(1, 0, entries, vec![]);
        assert!(codec.encode(&node).is_err());
    }
}
