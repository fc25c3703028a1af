use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use llama2_inference::{run_inference, InferenceConfigBuilder};
use log::error;

fn cli() -> Command {
    Command::new("llama2")
        .about("LLaMA-2 inference in Rust")
        .arg(
            Arg::new("checkpoint")
                .help("Model checkpoint file with the transformer weights")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("tokenizer")
                .short('z')
                .long("tokenizer")
                .value_name("PATH")
                .help("Tokenizer binary file with the vocabulary")
                .default_value("tokenizer.bin"),
        )
        .arg(
            Arg::new("temperature")
                .short('t')
                .long("temperature")
                .value_name("FLOAT")
                .help("Temperature for sampling in [0, inf); 0 is greedy")
                .default_value("1.0")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("topp")
                .short('p')
                .long("topp")
                .value_name("FLOAT")
                .help("Top-p for nucleus sampling in [0, 1]; values outside (0, 1) disable it")
                .default_value("0.9")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("steps")
                .short('n')
                .long("steps")
                .value_name("INT")
                .help("Max number of steps to run for; 0 uses the model's sequence length")
                .default_value("256")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("prompt")
                .short('i')
                .long("prompt")
                .value_name("STRING")
                .help("Input prompt"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("STRING")
                .help("Mode: generate|chat")
                .default_value("generate"),
        )
        .arg(
            Arg::new("system")
                .short('y')
                .long("system")
                .value_name("STRING")
                .help("System prompt in chat mode"),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .value_name("INT")
                .help("Random seed; defaults to the wall clock")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("threads")
                .short('j')
                .long("threads")
                .value_name("INT")
                .help("Worker pool size for the matmul kernels")
                .value_parser(clap::value_parser!(usize)),
        )
}

fn run(matches: &ArgMatches) -> Result<()> {
    let config = InferenceConfigBuilder::default()
        .checkpoint_path(matches.get_one::<String>("checkpoint"))
        .tokenizer_path(matches.get_one::<String>("tokenizer"))
        .temperature(matches.get_one::<f32>("temperature").copied())
        .topp(matches.get_one::<f32>("topp").copied())
        .steps(matches.get_one::<usize>("steps").copied())
        .prompt(matches.get_one::<String>("prompt"))
        .mode(matches.get_one::<String>("mode"))
        .system_prompt(matches.get_one::<String>("system"))
        .seed(matches.get_one::<u64>("seed").copied())
        .threads(matches.get_one::<usize>("threads").copied())
        .build()
        .map_err(|e| anyhow::anyhow!(e))?;

    run_inference(config)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_target(false)
        .init();

    let matches = cli().get_matches();
    if let Err(e) = run(&matches) {
        error!("Error: {e:#}");
        std::process::exit(1);
    }
}
