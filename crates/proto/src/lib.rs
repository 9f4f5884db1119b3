//! Shared gRPC protocol definitions for the Gravel cluster
//!
//! Client routing, the per-node request surface and the shard migration
//! stream all speak the `gravel` protocol defined in `proto/gravel.proto`.

// Include generated protobuf code
// The include_proto! macro generates a module matching the proto package name
pub mod gravel {
    tonic::include_proto!("gravel");
}

// Re-export commonly used types for convenience
pub use gravel::*;
