use std::env;
use std::fs;
use std::io::{self, Write};
use std::process;

use serde_json::json;

use flint::bytecode::{disassemble_instruction, Module, Opcode};
use flint::compile;
use flint::config::Config;
use flint::jit::CountingJit;
use flint::vm::Vm;

fn print_usage(program: &str) {
    eprintln!("flint v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  {} run <file.fl> [--config <file.ron>]   Compile and run", program);
    eprintln!("  {} check <file.fl>                       Check without running", program);
    eprintln!("  {} dis <file.fl> [--json]                Show compiled bytecode", program);
    eprintln!("  {} -r <code>                             Run code directly", program);
    eprintln!();
    eprintln!("Exit status: 0 on success, 1 on compile errors, 2 on runtime errors.");
}

fn read_source(path: &str) -> Result<String, i32> {
    fs::read_to_string(path).map_err(|error| {
        eprintln!("error reading '{}': {}", path, error);
        1
    })
}

fn load_config(args: &[String]) -> Result<Config, i32> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let Some(path) = iter.next() else {
                eprintln!("error: --config requires a path");
                return Err(1);
            };
            return Config::load(path).map_err(|error| {
                eprintln!("error: {}", error);
                1
            });
        }
    }
    Ok(Config::default())
}

fn run_source(source: &str, config: &Config) -> i32 {
    let module = match compile(source) {
        Ok(module) => module,
        Err(error) => {
            eprintln!("error: {}", error);
            return 1;
        }
    };

    let mut vm = if config.jit.enabled {
        Vm::with_strategy(module, Box::new(CountingJit::new(config.jit.threshold)))
    } else {
        Vm::new(module)
    };
    vm.set_trace(config.trace);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let result = vm.run(&mut out);
    let _ = out.flush();
    match result {
        Ok(()) => 0,
        Err(error) => {
            // Output produced before the failure has already been written.
            eprintln!("runtime error: {}", error);
            2
        }
    }
}

fn check_source(source: &str) -> i32 {
    match compile(source) {
        Ok(_) => 0,
        Err(error) => {
            eprintln!("error: {}", error);
            1
        }
    }
}

fn listing(module: &Module) -> serde_json::Value {
    let functions: Vec<serde_json::Value> = module
        .functions
        .iter()
        .map(|function| {
            let code: Vec<String> = (0..function.instruction_count())
                .map(|pc| match function.fetch(pc) {
                    Some((byte, operand)) => match Opcode::from_byte(byte) {
                        Some(op) => disassemble_instruction(op, operand),
                        None => format!("<invalid 0x{:02X}>", byte),
                    },
                    None => "<truncated>".to_string(),
                })
                .collect();
            json!({
                "name": function.name,
                "params": function
                    .params
                    .iter()
                    .map(|(name, ty)| json!({ "name": name, "type": ty.to_string() }))
                    .collect::<Vec<_>>(),
                "ret": function.ret.to_string(),
                "locals": function.locals,
                "code": code,
            })
        })
        .collect();

    json!({
        "entry": module.entry,
        "constants": {
            "ints": module.constants.ints(),
            "floats": module.constants.floats(),
        },
        "functions": functions,
    })
}

fn dis_source(source: &str, as_json: bool) -> i32 {
    let module = match compile(source) {
        Ok(module) => module,
        Err(error) => {
            eprintln!("error: {}", error);
            return 1;
        }
    };
    if as_json {
        match serde_json::to_string_pretty(&listing(&module)) {
            Ok(text) => println!("{}", text),
            Err(error) => {
                eprintln!("error: {}", error);
                return 1;
            }
        }
    } else {
        print!("{}", module.disassemble());
    }
    0
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage(&args[0]);
        process::exit(1);
    }

    let code = match args[1].as_str() {
        "-h" | "--help" => {
            print_usage(&args[0]);
            0
        }
        "-r" => {
            if args.len() < 3 {
                eprintln!("error: -r requires a code argument");
                process::exit(1);
            }
            match load_config(&args[3..]) {
                Ok(config) => run_source(&args[2], &config),
                Err(code) => code,
            }
        }
        "run" => {
            if args.len() < 3 {
                eprintln!("error: run requires a file argument");
                process::exit(1);
            }
            match (read_source(&args[2]), load_config(&args[3..])) {
                (Ok(source), Ok(config)) => run_source(&source, &config),
                (Err(code), _) | (_, Err(code)) => code,
            }
        }
        "check" => {
            if args.len() < 3 {
                eprintln!("error: check requires a file argument");
                process::exit(1);
            }
            match read_source(&args[2]) {
                Ok(source) => check_source(&source),
                Err(code) => code,
            }
        }
        "dis" => {
            if args.len() < 3 {
                eprintln!("error: dis requires a file argument");
                process::exit(1);
            }
            let as_json = args.iter().any(|arg| arg == "--json");
            match read_source(&args[2]) {
                Ok(source) => dis_source(&source, as_json),
                Err(code) => code,
            }
        }
        path => match (read_source(path), load_config(&args[2..])) {
            (Ok(source), Ok(config)) => run_source(&source, &config),
            (Err(code), _) | (_, Err(code)) => code,
        },
    };

    process::exit(code);
}
