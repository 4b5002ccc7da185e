//! File formats: binary meshes, OFF triangle meshes, and CSV field columns.

#[cfg(feature = "io-csv")]
pub mod csv;

#[cfg(feature = "io-mesh")]
pub mod mesh;

#[cfg(feature = "io-mesh")]
pub mod off;
