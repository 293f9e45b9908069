//! Fused post-op chains against the scalar epilogue.

mod common;

use common::*;
use convjit::{BiasData, ConvDesc, Convolution, DataType, EltwiseKind, PostOp, WeightData};

struct Case {
    name: &'static str,
    dst: DataType,
    ops: Vec<PostOp>,
    /// Relative error for f32 destinations, absolute for integer ones.
    tol: f32,
}

fn check_chain(case: &Case, int8: bool, seed: u64) {
    let (src_t, wei_t) = if int8 { (DataType::U8, DataType::S8) } else { (DataType::F32, DataType::F32) };
    let mut desc = ConvDesc::new(1, 6, 13, (6, 7), (3, 3)).pad(1).types(src_t, wei_t, case.dst).bias(DataType::F32);
    desc.post_ops = case.ops.clone();

    let mut r = rng(seed);
    let (src64, wei64, conv) = if int8 {
        let src = random_u8(&mut r, desc.src_elems());
        let wei = random_i8(&mut r, desc.weight_elems());
        let conv = Convolution::with_compiler(&compiler_with(Default::default()), desc.clone(), WeightData::S8(&wei));
        (to_f64(&src), to_f64(&wei), conv.map(|c| (c, Src::U8(src))))
    } else {
        let src = random_f32(&mut r, desc.src_elems());
        let wei = random_f32(&mut r, desc.weight_elems());
        let conv = Convolution::with_compiler(&compiler_with(Default::default()), desc.clone(), WeightData::F32(&wei));
        (to_f64(&src), to_f64(&wei), conv.map(|c| (c, Src::F32(src))))
    };
    let (conv, src) = conv.unwrap();
    let bias: Vec<f32> = (0..13).map(|c| c as f32 * 0.25 - 1.0).collect();
    let acc = conv_accumulate(&desc, &src64, &wei64);
    let ep = Epilogue {
        channels: 13,
        bias: Some(&bias),
        bias_scale: 1.0,
        post_ops: &desc.post_ops,
        dst_type: case.dst,
    };
    let mut pad = conv.new_scratchpad().unwrap();

    // previous destination contents matter for sum
    let prev: Vec<f32> = (0..desc.dst_elems()).map(|i| (i % 17) as f32).collect();
    let got: Vec<f32> = match case.dst {
        DataType::F32 => {
            let mut dst = prev.clone();
            run(&conv, &src, &bias, &mut dst, &mut pad);
            dst
        }
        DataType::S8 => {
            let mut dst: Vec<i8> = prev.iter().map(|&x| x as i8).collect();
            run(&conv, &src, &bias, &mut dst, &mut pad);
            dst.iter().map(|&x| x as f32).collect()
        }
        DataType::U8 => {
            let mut dst: Vec<u8> = prev.iter().map(|&x| x as u8).collect();
            run(&conv, &src, &bias, &mut dst, &mut pad);
            dst.iter().map(|&x| x as f32).collect()
        }
        DataType::S32 => {
            let mut dst: Vec<i32> = prev.iter().map(|&x| x as i32).collect();
            run(&conv, &src, &bias, &mut dst, &mut pad);
            dst.iter().map(|&x| x as f32).collect()
        }
    };
    for (i, (&g, &a)) in got.iter().zip(&acc).enumerate() {
        let want = ep.apply(i, a, prev[i]);
        let err = (g - want).abs();
        let bound = match case.dst {
            DataType::F32 => case.tol * want.abs().max(1.0),
            _ => case.tol,
        };
        assert!(err <= bound, "{} ({}): index {i}: got {g}, want {want}", case.name, case.dst);
    }
}

enum Src {
    F32(Vec<f32>),
    U8(Vec<u8>),
}

fn run<D: convjit::Element>(conv: &Convolution, src: &Src, bias: &[f32], dst: &mut [D], pad: &mut convjit::Scratchpad) {
    let bias = Some(BiasData::F32(bias));
    match src {
        Src::F32(s) => conv.execute(s, bias, dst, pad).unwrap(),
        Src::U8(s) => conv.execute(s, bias, dst, pad).unwrap(),
    }
}

#[test]
fn f32_chains() {
    if !host_runs_kernels() {
        return;
    }
    let scales: Vec<f32> = (0..13).map(|c| 1.0 + c as f32 * 0.1).collect();
    let cases = [
        Case { name: "relu", dst: DataType::F32, ops: vec![PostOp::relu()], tol: 1e-4 },
        Case {
            name: "leaky+scale",
            dst: DataType::F32,
            ops: vec![PostOp::eltwise(EltwiseKind::Relu { alpha: 0.1 }), PostOp::scale(0.5)],
            tol: 1e-4,
        },
        Case {
            name: "sum+clip",
            dst: DataType::F32,
            ops: vec![PostOp::sum(0.5), PostOp::eltwise(EltwiseKind::Clip { lo: -1.0, hi: 6.0 })],
            tol: 1e-4,
        },
        Case {
            name: "per-channel+bounded",
            dst: DataType::F32,
            ops: vec![PostOp::per_channel_scales(scales), PostOp::eltwise(EltwiseKind::BoundedRelu { alpha: 2.0 })],
            tol: 1e-4,
        },
        Case {
            name: "logistic",
            dst: DataType::F32,
            ops: vec![PostOp::eltwise(EltwiseKind::Logistic)],
            tol: 1e-3,
        },
        Case {
            name: "tanh+square",
            dst: DataType::F32,
            ops: vec![PostOp::eltwise(EltwiseKind::Tanh), PostOp::eltwise(EltwiseKind::Square)],
            tol: 1e-3,
        },
        Case {
            name: "abs+exp",
            dst: DataType::F32,
            ops: vec![PostOp::eltwise(EltwiseKind::Abs), PostOp::eltwise(EltwiseKind::Exp)],
            tol: 1e-3,
        },
    ];
    for (i, case) in cases.iter().enumerate() {
        check_chain(case, false, i as u64);
    }
}

#[test]
fn int8_chains_saturate() {
    if !host_runs_kernels() {
        return;
    }
    let cases = [
        Case { name: "scale to s8", dst: DataType::S8, ops: vec![PostOp::scale(0.01)], tol: 1.0 },
        // large values saturate at 127
        Case { name: "saturate s8", dst: DataType::S8, ops: vec![PostOp::scale(1.0)], tol: 0.0 },
        Case {
            name: "relu to u8",
            dst: DataType::U8,
            ops: vec![PostOp::scale(0.005), PostOp::relu()],
            tol: 1.0,
        },
        Case { name: "sum into u8", dst: DataType::U8, ops: vec![PostOp::scale(0.002), PostOp::sum(1.0)], tol: 1.0 },
        Case { name: "s32 with bias", dst: DataType::S32, ops: vec![], tol: 0.0 },
        Case { name: "f32 out", dst: DataType::F32, ops: vec![PostOp::scale(0.25)], tol: 1e-5 },
    ];
    for (i, case) in cases.iter().enumerate() {
        check_chain(case, true, 100 + i as u64);
    }
}
