use conclave_kernel_chain::{Digest, HashAlgorithm};
use serde::{Deserialize, Serialize};

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// Leaf of an envelope: BLAKE3 over the leaf prefix and the envelope hash bytes.
pub fn leaf_hash(event_hash: &Digest) -> Digest {
    let mut buf = Vec::with_capacity(33);
    buf.push(LEAF_PREFIX);
    buf.extend_from_slice(&event_hash.bytes);
    HashAlgorithm::Blake3.digest(&buf)
}

pub fn node_hash(left: &Digest, right: &Digest) -> Digest {
    let mut buf = Vec::with_capacity(65);
    buf.push(NODE_PREFIX);
    buf.extend_from_slice(&left.bytes);
    buf.extend_from_slice(&right.bytes);
    HashAlgorithm::Blake3.digest(&buf)
}

/// Which side of the running hash the sibling sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathStep {
    pub sibling: Digest,
    pub side: Side,
}

/// A binary Merkle tree over leaf hashes, every level kept.
///
/// A level with an odd number of nodes pairs its last node with itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleTree {
    levels: Vec<Vec<Digest>>,
}

impl MerkleTree {
    /// Build from envelope hashes. An empty set has no tree.
    pub fn build(event_hashes: &[Digest]) -> Option<Self> {
        if event_hashes.is_empty() {
            return None;
        }
        let mut levels = vec![event_hashes.iter().map(leaf_hash).collect::<Vec<_>>()];
        while let Some(level) = levels.last().filter(|l| l.len() > 1) {
            let next = level
                .chunks(2)
                .map(|pair| node_hash(&pair[0], pair.get(1).unwrap_or(&pair[0])))
                .collect();
            levels.push(next);
        }
        Some(Self { levels })
    }

    pub fn root(&self) -> Digest {
        self.levels[self.levels.len() - 1][0]
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    /// Sibling path from leaf `index` to the root.
    pub fn path(&self, index: usize) -> Option<Vec<PathStep>> {
        if index >= self.leaf_count() {
            return None;
        }
        let mut pos = index;
        let mut path = Vec::with_capacity(self.levels.len() - 1);
        for level in &self.levels[..self.levels.len() - 1] {
            let step = if pos % 2 == 0 {
                PathStep {
                    sibling: *level.get(pos + 1).unwrap_or(&level[pos]),
                    side: Side::Right,
                }
            } else {
                PathStep {
                    sibling: level[pos - 1],
                    side: Side::Left,
                }
            };
            path.push(step);
            pos /= 2;
        }
        Some(path)
    }
}

/// Check that `event_hash` sits under `root` along `path`. Needs nothing
/// but its arguments.
pub fn verify(event_hash: &Digest, path: &[PathStep], root: &Digest) -> bool {
    let computed = path.iter().fold(leaf_hash(event_hash), |acc, step| match step.side {
        Side::Left => node_hash(&step.sibling, &acc),
        Side::Right => node_hash(&acc, &step.sibling),
    });
    computed == *root
}
