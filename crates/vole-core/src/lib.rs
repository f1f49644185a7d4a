//! # vole-core
//!
//! Tensor, graph IR, and model-capture primitives for Vole.
//!
//! This crate provides:
//! - [`Tensor`] — CPU n-dimensional array (F32 / quantized I8 storage)
//! - [`Shape`] / [`DType`] — shapes and the closed dtype set
//! - [`Graph`] — the captured graph representation with per-op inference
//! - [`Module`] / [`Tracer`] — model contract and strict graph capture
//! - [`DynDim`] / [`DynamicShapeSpec`] — bounded symbolic dimensions
//! - [`Error`] / [`Result`] — the shared error type

pub mod dtype;
pub mod dynamic_shape;
pub mod error;
pub mod graph;
pub mod module;
pub mod shape;
pub mod tensor;

pub use dtype::DType;
pub use dynamic_shape::{DimEnv, DynDim, DynamicShapeSpec};
pub use error::{Error, Result};
pub use graph::{Graph, Node, NodeId, OpKind};
pub use module::{capture, Module, Tracer};
pub use shape::Shape;
pub use tensor::{Storage, Tensor, TensorStats};
