//! loomc CLI - Compile network descriptions to accelerator programs.

use std::fs;
use std::path::PathBuf;
use std::process;

use serde::{Deserialize, Serialize};

use loomc::compiler::GraphCompiler;
use loomc::graph::{Graph, GraphBuilder, GraphError, PadSpec, TensorId};
use loomc::isa::{Decoded, OpCode, decode};
use loomc::schema::{AccelSpec, Dtype};

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage(&args[0]);
        process::exit(1);
    }

    match args[1].as_str() {
        "compile" => cmd_compile(&args[2..]),
        "info" => cmd_info(&args[2..]),
        "--example" => print_example_config(),
        "--help" | "-h" => print_usage(&args[0]),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            print_usage(&args[0]);
            process::exit(1);
        }
    }
}

fn print_usage(program: &str) {
    eprintln!("loomc - Systolic-array CNN compiler");
    eprintln!();
    eprintln!("Usage: {} <command> [options]", program);
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  compile <network.json> <out-prefix> [accel.json]");
    eprintln!("        Compile a network; writes <out-prefix>.bin,");
    eprintln!("        <out-prefix>.txt and <out-prefix>.layout.json");
    eprintln!("  info <program.bin>     Show instruction-stream information");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --example              Print an example network description");
    eprintln!("  --help, -h             Show this help message");
}

// ---------------------------------------------------------------------
// Network description
// ---------------------------------------------------------------------

/// Graph input declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct InputConfig {
    /// NHWC shape.
    shape: [u64; 4],
    /// Fixed-point width of input samples.
    bits: u32,
    frac_bits: u32,
}

fn default_stride() -> u64 {
    1
}

fn default_scale_frac() -> u32 {
    8
}

/// One layer of the network.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum LayerConfig {
    Conv {
        filters: u64,
        kernel: u64,
        #[serde(default = "default_stride")]
        stride: u64,
        /// "same" or "valid".
        pad: String,
        weight_frac: u32,
        #[serde(default)]
        batch_norm: bool,
        #[serde(default = "default_scale_frac")]
        scale_frac: u32,
        /// Leaky-relu slope; omit for a linear layer.
        #[serde(default)]
        leaky_relu: Option<f32>,
    },
    MaxPool {
        kernel: u64,
        #[serde(default = "default_stride")]
        stride: u64,
    },
}

/// A network description consumed by `compile`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NetworkConfig {
    name: String,
    input: InputConfig,
    layers: Vec<LayerConfig>,
}

fn build_graph(net: &NetworkConfig) -> Result<Graph, GraphError> {
    let mut b = GraphBuilder::new(&net.name);
    let mut current: TensorId = b.input(
        "data",
        &net.input.shape,
        Dtype::fixed(net.input.bits, net.input.frac_bits),
    )?;

    for (i, layer) in net.layers.iter().enumerate() {
        match layer {
            LayerConfig::Conv {
                filters,
                kernel,
                stride,
                pad,
                weight_frac,
                batch_norm,
                scale_frac,
                leaky_relu,
            } => {
                current = b.scoped(&format!("conv{}", i), |b| {
                    let in_channels = *b.tensor_shape(current).last().unwrap_or(&1);
                    let in_frac = b.tensor_dtype(current).frac_bits();
                    let weights = b.param(
                        "weights",
                        &[*filters, *kernel, *kernel, in_channels],
                        Dtype::fixed(16, *weight_frac),
                        None,
                    )?;
                    let biases = b.param(
                        "biases",
                        &[*filters],
                        Dtype::fixed(32, weight_frac + in_frac),
                        None,
                    )?;
                    let pad = match pad.as_str() {
                        "same" => PadSpec::Same,
                        _ => PadSpec::Valid,
                    };
                    let mut t =
                        b.conv2d(current, weights, biases, pad, [1, *stride, *stride, 1], 1)?;

                    if *batch_norm {
                        let mean = b.param("mean", &[*filters], Dtype::fixed(16, 8), None)?;
                        let scale =
                            b.param("scale", &[*filters], Dtype::fixed(16, *scale_frac), None)?;
                        t = b.batch_norm(t, mean, scale, 1e-5)?;
                    }
                    if let Some(alpha) = leaky_relu {
                        let alpha_t = b.param(
                            "alpha",
                            &[1],
                            Dtype::FP32,
                            Some(alpha.to_le_bytes().to_vec()),
                        )?;
                        t = b.leaky_relu(t, alpha_t)?;
                    }
                    Ok::<TensorId, GraphError>(t)
                })?;
            }
            LayerConfig::MaxPool { kernel, stride } => {
                current = b.scoped(&format!("pool{}", i), |b| {
                    b.max_pool(
                        current,
                        [1, *kernel, *kernel, 1],
                        [1, *stride, *stride, 1],
                        PadSpec::Valid,
                    )
                })?;
            }
        }
    }

    Ok(b.finish())
}

// ---------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------

fn cmd_compile(args: &[String]) {
    if args.len() < 2 {
        eprintln!("Usage: loomc compile <network.json> <out-prefix> [accel.json]");
        process::exit(1);
    }
    let network_path = PathBuf::from(&args[0]);
    let out_prefix = PathBuf::from(&args[1]);

    let net: NetworkConfig = read_json(&network_path);
    let acc: AccelSpec = match args.get(2) {
        Some(path) => read_json(&PathBuf::from(path)),
        None => AccelSpec::default(),
    };
    if let Err(e) = acc.validate() {
        eprintln!("Invalid accelerator spec: {}", e);
        process::exit(1);
    }

    let mut graph = match build_graph(&net) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("Invalid network: {}", e);
            process::exit(1);
        }
    };

    println!(
        "Compiling {} for a {}x{} array",
        net.name, acc.rows, acc.cols
    );
    let out = match GraphCompiler::new(acc).compile(&mut graph) {
        Ok(out) => out,
        Err(e) => {
            eprintln!("Compilation failed: {}", e);
            process::exit(1);
        }
    };

    for block in out.program.blocks() {
        println!("  {:>6} words  {}", block.words.len(), block.name);
    }
    println!("Total: {} words", out.program.word_count());

    let bin_path = out_prefix.with_extension("bin");
    let txt_path = out_prefix.with_extension("txt");
    let layout_path = out_prefix.with_extension("layout.json");
    if let Err(e) = out
        .program
        .write_binary(&bin_path)
        .and_then(|_| out.program.write_debug_text(&txt_path))
        .and_then(|_| out.layout.write_json(&layout_path))
    {
        eprintln!("Failed to write outputs: {}", e);
        process::exit(1);
    }
    println!(
        "Wrote {}, {} and {}",
        bin_path.display(),
        txt_path.display(),
        layout_path.display()
    );
}

fn cmd_info(args: &[String]) {
    if args.is_empty() {
        eprintln!("Usage: loomc info <program.bin>");
        process::exit(1);
    }
    let bytes = match fs::read(&args[0]) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Failed to read {}: {}", args[0], e);
            process::exit(1);
        }
    };
    if bytes.len() % 4 != 0 {
        eprintln!("{} is not a whole number of 32-bit words", args[0]);
        process::exit(1);
    }

    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let mut blocks = 0;
    let mut pu_blocks = 0;
    let mut last_marker = false;
    // Words remaining inside a PU block; its closing repeat word reuses
    // the BLOCK_END opcode and must not count as a macro-op boundary.
    let mut in_pu = 0usize;
    for &w in &words {
        match decode(w) {
            Decoded::Control {
                op_code, immediate, ..
            } if op_code == OpCode::PuBlock as u8 => {
                pu_blocks += 1;
                in_pu = immediate as usize + 2;
            }
            Decoded::Control {
                op_code, immediate, ..
            } if op_code == OpCode::BlockEnd as u8 && in_pu == 0 => {
                blocks += 1;
                last_marker = immediate == 1;
            }
            _ => {}
        }
        in_pu = in_pu.saturating_sub(1);
    }

    println!("{}", args[0]);
    println!("  {} words ({} bytes)", words.len(), bytes.len());
    println!("  {} macro-op blocks, {} PU blocks", blocks, pu_blocks);
    println!(
        "  final block marker: {}",
        if last_marker { "present" } else { "MISSING" }
    );
}

fn print_example_config() {
    let example = NetworkConfig {
        name: "tiny-conv".to_string(),
        input: InputConfig {
            shape: [1, 32, 32, 16],
            bits: 16,
            frac_bits: 8,
        },
        layers: vec![
            LayerConfig::Conv {
                filters: 16,
                kernel: 3,
                stride: 1,
                pad: "same".to_string(),
                weight_frac: 14,
                batch_norm: true,
                scale_frac: 8,
                leaky_relu: Some(0.1),
            },
            LayerConfig::MaxPool {
                kernel: 2,
                stride: 2,
            },
            LayerConfig::Conv {
                filters: 32,
                kernel: 3,
                stride: 1,
                pad: "same".to_string(),
                weight_frac: 14,
                batch_norm: true,
                scale_frac: 8,
                leaky_relu: Some(0.1),
            },
        ],
    };
    match serde_json::to_string_pretty(&example) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &PathBuf) -> T {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Failed to read {}: {}", path.display(), e);
            process::exit(1);
        }
    };
    match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("Failed to parse {}: {}", path.display(), e);
            process::exit(1);
        }
    }
}
