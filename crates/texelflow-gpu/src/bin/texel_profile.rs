//! Smoke/profile binary: brings up the GPU context, runs round-trips and
//! kernel dispatches across a size sweep, and writes a JSON report.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use log::info;
use serde::Serialize;
use texelflow_gpu::{
    shaders, ElementType, GpuContext, GpuContextOptions, HostTensorView, KernelRequest,
    TexelLayout,
};

const VALUE_TOLERANCE: f32 = 1e-5;

#[derive(Serialize)]
struct RoundTripSample {
    rows: usize,
    cols: usize,
    layout: String,
    upload_download_millis: f64,
}

#[derive(Serialize)]
struct DispatchSample {
    rows: usize,
    cols: usize,
    iterations: usize,
    gpu_millis: f64,
    timing_unreliable: bool,
}

#[derive(Serialize)]
struct ProfileReport {
    device: String,
    round_trips: Vec<RoundTripSample>,
    dispatches: Vec<DispatchSample>,
    diagnostics: texelflow_gpu::ContextDiagnostics,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let mut output_path = PathBuf::from("texel_profile.json");
    let mut quick = false;
    let mut iterations = 16usize;
    if let Some(pos) = args.iter().position(|a| a == "--output") {
        if pos + 1 < args.len() {
            output_path = PathBuf::from(args[pos + 1].clone());
        }
    }
    if args.iter().any(|a| a == "--quick") {
        quick = true;
    }
    if let Some(pos) = args.iter().position(|a| a == "--iterations") {
        if pos + 1 < args.len() {
            if let Ok(v) = args[pos + 1].parse::<usize>() {
                iterations = v.max(1);
            }
        }
    }

    let ctx = GpuContext::new(GpuContextOptions::default())
        .context("texelflow: GPU context initialization failed")?;
    info!("profiling on {}", ctx.device_info());

    let sizes: &[(usize, usize)] = if quick {
        &[(64, 64), (255, 257)]
    } else {
        &[(64, 64), (255, 257), (512, 512), (1024, 1023)]
    };

    let mut round_trips = Vec::new();
    for &(rows, cols) in sizes {
        for layout in [TexelLayout::Unpacked, TexelLayout::Packed] {
            round_trips.push(profile_round_trip(&ctx, rows, cols, layout)?);
        }
    }

    let mut dispatches = Vec::new();
    for &(rows, cols) in sizes {
        dispatches.push(profile_dispatch(&ctx, rows, cols, iterations)?);
    }

    let report = ProfileReport {
        device: ctx.device_info(),
        round_trips,
        dispatches,
        diagnostics: ctx.diagnostics(),
    };
    let json = serde_json::to_string_pretty(&report)?;
    let mut file = File::create(&output_path)
        .with_context(|| format!("creating {}", output_path.display()))?;
    file.write_all(json.as_bytes())?;
    info!("report written to {}", output_path.display());
    Ok(())
}

fn profile_round_trip(
    ctx: &GpuContext,
    rows: usize,
    cols: usize,
    layout: TexelLayout,
) -> Result<RoundTripSample> {
    let data: Vec<f32> = (0..rows * cols).map(|i| (i % 1013) as f32 * 0.25).collect();
    let start = std::time::Instant::now();
    let handle = ctx.allocate(rows, cols, layout, ElementType::F32)?;
    ctx.upload(
        &handle,
        &HostTensorView {
            data: &data,
            rows,
            cols,
        },
    )?;
    let back = ctx.download(&handle)?;
    let elapsed = start.elapsed();
    for (i, (a, b)) in data.iter().zip(back.data.iter()).enumerate() {
        if (a - b).abs() > VALUE_TOLERANCE {
            return Err(anyhow!(
                "round trip mismatch at {i}: uploaded {a}, downloaded {b}"
            ));
        }
    }
    ctx.release(&handle)?;
    Ok(RoundTripSample {
        rows,
        cols,
        layout: format!("{layout:?}"),
        upload_download_millis: elapsed.as_secs_f64() * 1e3,
    })
}

fn profile_dispatch(
    ctx: &GpuContext,
    rows: usize,
    cols: usize,
    iterations: usize,
) -> Result<DispatchSample> {
    let data: Vec<f32> = (0..rows * cols).map(|i| (i % 97) as f32).collect();
    let a = ctx.allocate(rows, cols, TexelLayout::Unpacked, ElementType::F32)?;
    ctx.upload(
        &a,
        &HostTensorView {
            data: &data,
            rows,
            cols,
        },
    )?;

    let timer = ctx.begin_timer_query()?;
    let mut outputs = Vec::with_capacity(iterations);
    for _ in 0..iterations {
        let out = ctx.dispatch_kernel(&KernelRequest {
            label: "profile-add",
            source: shaders::ADD_SHADER,
            inputs: &[("a", &a), ("b", &a)],
            output_rows: rows,
            output_cols: cols,
            output_layout: TexelLayout::Unpacked,
            output_element: ElementType::F32,
            params: None,
        })?;
        outputs.push(out);
    }
    ctx.end_timer_query()?;
    let elapsed = ctx.resolve_timer_query(timer)?;

    let back = ctx.download(outputs.last().expect("at least one dispatch"))?;
    let expected = data[0] * 2.0;
    if (back.data[0] - expected).abs() > VALUE_TOLERANCE {
        return Err(anyhow!(
            "dispatch result mismatch: expected {expected}, got {}",
            back.data[0]
        ));
    }
    for out in &outputs {
        ctx.release(out)?;
    }
    ctx.release(&a)?;
    Ok(DispatchSample {
        rows,
        cols,
        iterations,
        gpu_millis: elapsed.millis,
        timing_unreliable: elapsed.unreliable,
    })
}
