//! convjit: runtime-generated x86-64 kernels for convolution and quantized
//! GEMM.
//!
//! Kernels are specialised per problem and per CPU:
//! - **Capability detection**: SSE4.1, AVX2, AVX-512 and VNNI detected once per process
//! - **Planning**: register blocking, spatial unroll, edge variants and
//!   scratch-pad layout chosen from the problem shape and the ISA
//! - **Code generation**: one routine with an entry point per variant,
//!   emitted through `iced-x86` and mapped executable
//! - **Fused post-ops**: eltwise, rescale and sum applied in registers
//!   before the store
//! - **Dispatch**: work items spread over a rayon pool, bit-identical for
//!   any thread count
//!
//! # Quick Start
//!
//! ```ignore
//! use convjit::{ConvDesc, Convolution, WeightData};
//!
//! let desc = ConvDesc::new(1, 16, 32, (56, 56), (3, 3)).pad(1);
//! let conv = Convolution::new(desc, WeightData::F32(&weights))?;
//! let mut pad = conv.new_scratchpad()?;
//! conv.execute(&src, None, &mut dst, &mut pad)?;
//! ```

pub mod cache_params;
pub mod compiler;
pub mod config;
pub mod dispatch;
pub mod dispatcher;
pub mod primitive;
pub mod types;
pub mod weights;

pub use compiler::buffer_alloc::{Scratchpad, ScratchpadLayout};
pub use compiler::ir::{ConvDesc, EltwiseKind, GemmDesc, PostOp, ProblemDescriptor, Scales};
pub use compiler::planner::ExecutionPlan;
pub use compiler::{CompiledKernel, KernelCompiler};
pub use cache_params::CacheSizes;
pub use config::JitConfig;
pub use dispatch::{capabilities, CapabilitySet, IsaLevel};
pub use dispatcher::{Dispatcher, IterationSpace, WorkItem};
pub use primitive::{BiasData, Convolution, Element, Gemm, WeightData};
pub use types::{DataType, JitError, JitResult};
pub use weights::PackedWeights;
