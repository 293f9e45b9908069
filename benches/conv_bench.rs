//! Code-generation latency and kernel throughput.
//!
//! Run with: cargo bench --bench conv_bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use convjit::compiler::generate;
use convjit::{
    capabilities, ConvDesc, Convolution, DataType, Gemm, GemmDesc, IsaLevel, JitConfig, KernelCompiler, PostOp,
    WeightData,
};

fn resnet_block() -> ConvDesc {
    ConvDesc::new(1, 64, 64, (56, 56), (3, 3)).pad(1).post_op(PostOp::relu())
}

fn bench_generate(c: &mut Criterion) {
    if !capabilities().supports(IsaLevel::Avx2) {
        return;
    }
    let compiler = KernelCompiler::new(*capabilities(), JitConfig::default());
    let plan = compiler.plan(&resnet_block().into()).unwrap();
    c.bench_function("generate_conv3x3_64x64", |b| {
        b.iter(|| black_box(generate(black_box(&plan), 0)).unwrap())
    });
}

fn bench_conv_f32(c: &mut Criterion) {
    if !capabilities().supports(IsaLevel::Avx2) {
        return;
    }
    let desc = resnet_block();
    let src = vec![0.5f32; desc.src_elems()];
    let wei = vec![0.01f32; desc.weight_elems()];
    let conv = Convolution::new(desc.clone(), WeightData::F32(&wei)).unwrap();
    let mut pad = conv.new_scratchpad().unwrap();
    let mut dst = vec![0.0f32; desc.dst_elems()];
    let flops = 2 * desc.dst_elems() * desc.ic_per_group() * desc.kernel_h * desc.kernel_w;
    let mut group = c.benchmark_group("conv_f32");
    group.throughput(Throughput::Elements(flops as u64));
    group.bench_function("3x3_64x64_56", |b| {
        b.iter(|| conv.execute(black_box(&src), None, &mut dst, &mut pad).unwrap())
    });
    group.finish();
}

fn bench_conv_int8(c: &mut Criterion) {
    if !capabilities().supports(IsaLevel::Avx2) {
        return;
    }
    let desc = resnet_block()
        .types(DataType::U8, DataType::S8, DataType::U8)
        .src_zero_point(128);
    let desc = ConvDesc { post_ops: vec![PostOp::scale(0.01), PostOp::relu()], ..desc };
    let src = vec![130u8; desc.src_elems()];
    let wei = vec![1i8; desc.weight_elems()];
    let conv = Convolution::new(desc.clone(), WeightData::S8(&wei)).unwrap();
    let mut pad = conv.new_scratchpad().unwrap();
    let mut dst = vec![0u8; desc.dst_elems()];
    let mut group = c.benchmark_group("conv_int8");
    group.throughput(Throughput::Elements(desc.dst_elems() as u64));
    group.bench_function("3x3_64x64_56", |b| {
        b.iter(|| conv.execute(black_box(&src), None, &mut dst, &mut pad).unwrap())
    });
    group.finish();
}

fn bench_gemm_int8(c: &mut Criterion) {
    if !capabilities().supports(IsaLevel::Avx2) {
        return;
    }
    let desc = GemmDesc::new(256, 256, 256);
    let a = vec![3u8; desc.m * desc.k];
    let b = vec![-2i8; desc.k * desc.n];
    let gemm = Gemm::new(desc.clone(), &b).unwrap();
    let mut pad = gemm.new_scratchpad().unwrap();
    let mut out = vec![0i32; desc.m * desc.n];
    c.bench_function("gemm_u8s8s32_256", |bench| {
        bench.iter(|| gemm.execute(black_box(&a), None, &mut out, &mut pad).unwrap())
    });
}

criterion_group!(
    name = conv;
    config = Criterion::default()
        .warm_up_time(std::time::Duration::from_secs(1))
        .measurement_time(std::time::Duration::from_secs(5))
        .sample_size(20);
    targets =
        bench_generate,
        bench_conv_f32,
        bench_conv_int8,
        bench_gemm_int8,
);
criterion_main!(conv);
