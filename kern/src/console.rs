//! Kernel console.
//!
//! A tiny command interpreter for poking at kernel state from a debug
//! channel. `exc` enumerates the exception vector with dispatch counts.

use alloc::string::String;
use core::fmt::Write;

use abi::ErrorCode;

use crate::startup::Kernel;

/// Executes one console command line and returns its output.
pub fn execute(k: &Kernel, line: &str) -> Result<String, ErrorCode> {
    let mut words = line.split_whitespace();
    let cmd = words.next().unwrap_or("");
    match cmd {
        "help" => {
            let mut out = String::new();
            let _ = writeln!(out, "exc    print exception table");
            let _ = writeln!(out, "tasks  print task table summary");
            let _ = writeln!(out, "help   this text");
            Ok(out)
        }
        "exc" => Ok(k.exc.format()),
        "tasks" => {
            let mut out = String::new();
            let _ = writeln!(out, "task  alive  threads  gen");
            for idx in 0..k.task_count() {
                let st = crate::task::status(k, idx);
                if !st.alive && st.fault.is_none() {
                    continue;
                }
                let _ = writeln!(
                    out,
                    "{:<5} {:<6} {:<8} {}",
                    idx, st.alive, st.threads, st.generation.0,
                );
            }
            Ok(out)
        }
        "" => Ok(String::new()),
        _ => Err(ErrorCode::NotSup),
    }
}
