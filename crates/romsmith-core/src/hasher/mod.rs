pub mod digest;

pub use digest::{hash_data, hash_file, hash_reader, HashSelection, Hashes, MultiHasher};
