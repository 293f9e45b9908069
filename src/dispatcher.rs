//! Execution dispatcher: partitions the iteration space into work items
//! and invokes the generated routine once per item.
//!
//! A work item is one output row segment: `(n, g, oc_chunk, oh, ow_block)`.
//! It writes `ur_w` pixels by one channel chunk, so items never overlap and
//! run in any order on any thread. When a float reduction is split along
//! input channels, the chunks of one item run back to back on the same
//! thread.

use std::ops::Range;

use rayon::prelude::*;

use crate::compiler::abi::{CallRecord, FLAG_IC_FIRST, FLAG_IC_LAST};
use crate::compiler::executable::GeneratedRoutine;
use crate::compiler::planner::{ExecutionPlan, KernelFamily};
use crate::types::{JitError, JitResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkItem {
    pub n: usize,
    pub g: usize,
    pub oc_chunk: usize,
    pub oh: usize,
    pub ow_block: usize,
}

/// Output elements one work item writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFootprint {
    pub n: usize,
    pub oh: usize,
    pub ow: Range<usize>,
    /// Absolute destination channels.
    pub channels: Range<usize>,
}

/// Dense enumeration of work items, `ow_block` fastest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationSpace {
    pub mb: usize,
    pub groups: usize,
    pub oc_chunks: usize,
    pub oh: usize,
    pub ow_blocks: usize,
}

impl IterationSpace {
    pub fn new(plan: &ExecutionPlan) -> Self {
        let g = &plan.geometry;
        IterationSpace {
            mb: g.mb,
            // depthwise channels are the vector dimension
            groups: if plan.family == KernelFamily::DepthwiseConv { 1 } else { g.ngroups },
            oc_chunks: plan.oc_chunks(),
            oh: g.oh,
            ow_blocks: plan.ow_blocks.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.mb * self.groups * self.oc_chunks * self.oh * self.ow_blocks
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn item(&self, mut i: usize) -> WorkItem {
        let ow_block = i % self.ow_blocks;
        i /= self.ow_blocks;
        let oh = i % self.oh;
        i /= self.oh;
        let oc_chunk = i % self.oc_chunks;
        i /= self.oc_chunks;
        let g = i % self.groups;
        let n = i / self.groups;
        WorkItem { n, g, oc_chunk, oh, ow_block }
    }

    pub fn items(&self) -> impl Iterator<Item = WorkItem> + '_ {
        (0..self.len()).map(|i| self.item(i))
    }
}

/// Base addresses of every buffer a routine reads or writes.
#[derive(Debug, Clone, Copy)]
pub struct Buffers {
    pub src: *const u8,
    pub weights: *const u8,
    pub dst: *mut u8,
    pub channel_params: *const u8,
    pub compensation: *const i32,
}

// SAFETY: plain addresses; `Dispatcher::run` documents the aliasing rules.
unsafe impl Send for Buffers {}
unsafe impl Sync for Buffers {}

impl WorkItem {
    /// Entry point serving this item.
    pub fn variant(&self, plan: &ExecutionPlan) -> usize {
        let spatial = plan.ow_blocks[self.ow_block].spatial;
        plan.variant_index(spatial, plan.chunk_has_tail(self.oc_chunk))
    }

    /// First channel (within the group) of this item's chunk.
    fn chunk_channel(&self, plan: &ExecutionPlan) -> usize {
        self.oc_chunk * plan.nb_oc_blocking * plan.simd_lanes
    }

    pub fn footprint(&self, plan: &ExecutionPlan) -> OutputFootprint {
        let g = &plan.geometry;
        let block = plan.ow_blocks[self.ow_block];
        let ur = plan.spatial_variants[block.spatial].ur_w;
        let per_group = if plan.family == KernelFamily::DepthwiseConv { g.ngroups } else { g.oc };
        let c0 = self.chunk_channel(plan);
        let c1 = (c0 + plan.nb_oc_blocking * plan.simd_lanes).min(per_group);
        let base = self.g * per_group;
        OutputFootprint {
            n: self.n,
            oh: self.oh,
            ow: block.ow_start..block.ow_start + ur,
            channels: base + c0..base + c1,
        }
    }

    /// Call record for input-channel chunk `ic_chunk` of this item.
    pub fn call_record(&self, plan: &ExecutionPlan, bufs: &Buffers, ic_chunk: usize) -> CallRecord {
        let g = &plan.geometry;
        let ssz = plan.src_type.size() as isize;
        let dsz = plan.dst_type.size();
        let kh = g.kh_range(self.oh);
        let ow0 = plan.ow_blocks[self.ow_block].ow_start;
        let col = (ow0 * g.stride_w) as isize - g.pad_l as isize;
        let c0 = self.chunk_channel(plan);

        let (src_ch, dst_ch) = match plan.family {
            KernelFamily::DepthwiseConv => (c0, c0),
            _ => (
                self.g * g.ic + ic_chunk * plan.ic_split.chunk_channels,
                self.g * g.oc + c0,
            ),
        };
        let src_row = (self.n * g.ih) as isize + kh.ih_start;
        let src_off = (src_row * g.iw as isize + col) * g.src_pixel_stride as isize + src_ch as isize;
        let dst_off = ((self.n * g.oh + self.oh) * g.ow + ow0) * g.dst_pixel_stride + dst_ch;

        let w = &plan.weights;
        let blocks = self.oc_chunk * plan.nb_oc_blocking;
        let w_off = self.g * w.group_stride + blocks * w.block_stride + ic_chunk * plan.packs_per_call() * w.vector_bytes;
        let padded_ch = (self.g * plan.nb_oc_total + blocks) * plan.simd_lanes;

        let mut flags = 0;
        if ic_chunk == 0 {
            flags |= FLAG_IC_FIRST;
        }
        if ic_chunk + 1 == plan.ic_split.chunks {
            flags |= FLAG_IC_LAST;
        }

        CallRecord {
            // may point before the row for left-padded blocks; never read there
            src: bufs.src.wrapping_offset(src_off * ssz),
            weights: bufs.weights.wrapping_add(w_off),
            dst: bufs.dst.wrapping_add(dst_off * dsz),
            channel_params: bufs.channel_params.wrapping_add(padded_ch * 4),
            compensation: bufs.compensation.wrapping_add(padded_ch),
            kh_trip: kh.trip as u64,
            kh_overflow_top: kh.top_overflow as u64,
            kh_overflow_bottom: kh.bottom_overflow as u64,
            flags,
        }
    }
}

/// Runs routines over their iteration space on a rayon pool.
pub struct Dispatcher {
    pool: Option<rayon::ThreadPool>,
}

impl Dispatcher {
    /// `None` uses the global rayon pool; `Some(n)` builds a dedicated one.
    pub fn new(num_threads: Option<usize>) -> JitResult<Self> {
        let pool = match num_threads {
            None => None,
            Some(n) => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n.max(1))
                    .thread_name(|idx| format!("convjit-worker{idx}"))
                    .build()
                    .map_err(|e| JitError::ThreadPool(e.to_string()))?,
            ),
        };
        Ok(Dispatcher { pool })
    }

    pub fn threads(&self) -> usize {
        match &self.pool {
            Some(p) => p.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }

    /// Invoke `routine` on every work item of `plan`.
    ///
    /// # Safety
    /// `bufs` must describe buffers laid out exactly as `plan` expects and
    /// valid for the whole call; `dst` must not be read or written by
    /// anything else until `run` returns.
    pub unsafe fn run(&self, routine: &GeneratedRoutine, plan: &ExecutionPlan, bufs: &Buffers) -> JitResult<()> {
        let space = IterationSpace::new(plan);
        if routine.entry_count() != plan.variants.len() {
            return Err(JitError::BufferMismatch(format!(
                "routine has {} entries, plan needs {}",
                routine.entry_count(),
                plan.variants.len()
            )));
        }
        log::trace!("{} dispatch: {} items on {} threads", plan.family, space.len(), self.threads());
        let chunks = plan.ic_split.chunks;
        let work = |i: usize| -> JitResult<()> {
            let item = space.item(i);
            let variant = item.variant(plan);
            for c in 0..chunks {
                let rec = item.call_record(plan, bufs, c);
                // SAFETY: upheld by the caller; items write disjoint outputs.
                unsafe { routine.call(variant, &rec)? };
            }
            Ok(())
        };
        let all = || (0..space.len()).into_par_iter().try_for_each(work);
        match &self.pool {
            Some(p) => p.install(all),
            None => all(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::ConvDesc;
    use crate::compiler::planner::plan_dense;
    use crate::config::JitConfig;
    use crate::dispatch::{CapabilitySet, IsaLevel};
    use std::collections::HashSet;

    fn plan(desc: &ConvDesc) -> ExecutionPlan {
        plan_dense(desc, &CapabilitySet::for_level(IsaLevel::Avx2), &JitConfig::default().with_max_ur_w(3)).unwrap()
    }

    #[test]
    fn items_enumerate_every_index_once() {
        let p = plan(&ConvDesc::new(2, 8, 24, (5, 7), (3, 3)).groups(2).pad(1));
        let space = IterationSpace::new(&p);
        let items: HashSet<_> = space.items().collect();
        assert_eq!(items.len(), space.len());
        assert_eq!(space.groups, 2);
        assert_eq!(space.oh, 5);
    }

    #[test]
    fn footprints_cover_output_exactly_once() {
        let desc = ConvDesc::new(1, 4, 20, (6, 7), (3, 3)).pad(1);
        let p = plan(&desc);
        let space = IterationSpace::new(&p);
        let mut seen = vec![0u8; desc.dst_elems()];
        for item in space.items() {
            let f = item.footprint(&p);
            for ow in f.ow.clone() {
                for c in f.channels.clone() {
                    seen[(f.oh * desc.out_w() + ow) * 20 + c] += 1;
                }
            }
        }
        assert!(seen.iter().all(|&x| x == 1));
    }

    #[test]
    fn top_row_record() {
        let desc = ConvDesc::new(1, 4, 8, (6, 6), (3, 3)).pad(1);
        let p = plan(&desc);
        let bufs = Buffers {
            src: 0x10000 as *const u8,
            weights: 0x20000 as *const u8,
            dst: 0x30000 as *mut u8,
            channel_params: std::ptr::null(),
            compensation: std::ptr::null(),
        };
        let item = WorkItem { n: 0, g: 0, oc_chunk: 0, oh: 0, ow_block: 0 };
        let rec = item.call_record(&p, &bufs, 0);
        assert_eq!((rec.kh_overflow_top, rec.kh_trip, rec.kh_overflow_bottom), (1, 2, 0));
        // row 0, column -1
        assert_eq!(rec.src as isize, 0x10000 - 4 * 4);
        assert_eq!(rec.dst as usize, 0x30000);
        assert_eq!(rec.flags, FLAG_IC_FIRST | FLAG_IC_LAST);
    }

    #[test]
    fn split_chunks_carry_flags() {
        let desc = ConvDesc::new(1, 8, 8, (4, 4), (1, 1));
        let p = plan_dense(
            &desc,
            &CapabilitySet::for_level(IsaLevel::Avx2),
            &JitConfig::default().with_max_ic_chunk(4),
        )
        .unwrap();
        assert_eq!(p.ic_split.chunks, 2);
        let bufs = Buffers {
            src: 0x1000 as *const u8,
            weights: 0x2000 as *const u8,
            dst: 0x3000 as *mut u8,
            channel_params: std::ptr::null(),
            compensation: std::ptr::null(),
        };
        let item = WorkItem { n: 0, g: 0, oc_chunk: 0, oh: 0, ow_block: 0 };
        let first = item.call_record(&p, &bufs, 0);
        let last = item.call_record(&p, &bufs, 1);
        assert_eq!(first.flags, FLAG_IC_FIRST);
        assert_eq!(last.flags, FLAG_IC_LAST);
        assert_eq!(last.src as usize - first.src as usize, 4 * 4);
        assert_eq!(last.weights as usize - first.weights as usize, 4 * p.vector_bytes());
    }

    #[test]
    fn dedicated_pool_size() {
        let d = Dispatcher::new(Some(3)).unwrap();
        assert_eq!(d.threads(), 3);
    }
}
