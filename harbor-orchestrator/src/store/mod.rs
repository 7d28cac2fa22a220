pub mod disk;

pub use disk::ManifestStore;
