//! Startup argv handling and VM-flag interpretation.
//!
//! Node-compatible splitting: every leading `--` argument belongs to the VM
//! (`process.execArgv`) until the first non-flag argument, which is presumed
//! to be the script name; everything after goes to the script untouched.
//!
//! The recognized flag set is closed. Flags handled by outer layers are
//! accepted as no-ops here; anything else is a fatal configuration error
//! raised before event processing begins.

use crate::process::Process;
use thiserror::Error;

/// Name reported as `argv[0]`, as any Node interpreter would.
pub const EXECUTABLE_NAME: &str = "node";

/// A VM flag the runtime does not recognize.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlagError {
    /// Unknown `--` option.
    #[error("unsupported command-line option {0}")]
    Unsupported(String),
}

/// Result of splitting raw arguments into VM flags and script argv.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ParsedArgv {
    /// `process.argv` minus the executable name.
    pub argv: Vec<String>,
    /// Leading `--` flags consumed by the VM.
    pub exec_argv: Vec<String>,
}

/// Splits raw arguments the way `node` does when no script name is known
/// up front.
#[must_use]
pub fn split_raw_argv(args: &[String]) -> ParsedArgv {
    let mut parsed = ParsedArgv::default();
    let mut vm_args_done = false;
    for arg in args {
        if vm_args_done {
            parsed.argv.push(arg.clone());
        } else if arg.starts_with("--") {
            parsed.exec_argv.push(arg.clone());
        } else {
            parsed.argv.push(arg.clone());
            vm_args_done = true;
        }
    }
    parsed
}

/// Applies recognized VM flags to the process object.
///
/// # Errors
///
/// Returns [`FlagError::Unsupported`] for any flag outside the recognized
/// set; the caller turns that into a fatal configuration error.
pub fn apply_vm_flags(process: &mut dyn Process, exec_argv: &[String]) -> Result<(), FlagError> {
    for arg in exec_argv {
        match arg.as_str() {
            "--expose-gc" | "--expose_gc" => process.install_gc_global(),
            "--throw-deprecation" => process.set_throw_deprecation(true),
            "--trace-deprecation" => process.set_trace_deprecation(true),
            "--no-deprecation" => {
                process.set_throw_deprecation(false);
                process.set_trace_deprecation(false);
            }
            // Interpreted by the shell; recognized so they don't fail here.
            a if a.starts_with("--http-adapter") => {}
            a if a.starts_with("--node-version") || a.starts_with("--node_version") => {}
            "--debug" | "--trace" => {}
            other => return Err(FlagError::Unsupported(other.to_string())),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestProcess;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn leading_flags_go_to_exec_argv() {
        let parsed = split_raw_argv(&strings(&[
            "--expose-gc",
            "--trace",
            "script.js",
            "--not-a-vm-flag",
        ]));
        assert_eq!(parsed.exec_argv, strings(&["--expose-gc", "--trace"]));
        assert_eq!(parsed.argv, strings(&["script.js", "--not-a-vm-flag"]));
    }

    #[test]
    fn no_flags_means_empty_exec_argv() {
        let parsed = split_raw_argv(&strings(&["app.js", "--verbose"]));
        assert!(parsed.exec_argv.is_empty());
        assert_eq!(parsed.argv, strings(&["app.js", "--verbose"]));
    }

    #[test]
    fn recognized_flags_apply() {
        let mut process = TestProcess::new();
        apply_vm_flags(
            &mut process,
            &strings(&[
                "--expose_gc",
                "--throw-deprecation",
                "--trace-deprecation",
                "--http-adapter=foo",
                "--node-version=0.10",
                "--debug",
            ]),
        )
        .unwrap();
        assert!(process.gc_installed());
        assert_eq!(process.throw_deprecation(), Some(true));
        assert_eq!(process.trace_deprecation(), Some(true));
    }

    #[test]
    fn no_deprecation_clears_both() {
        let mut process = TestProcess::new();
        apply_vm_flags(&mut process, &strings(&["--no-deprecation"])).unwrap();
        assert_eq!(process.throw_deprecation(), Some(false));
        assert_eq!(process.trace_deprecation(), Some(false));
    }

    #[test]
    fn unknown_flag_is_fatal() {
        let mut process = TestProcess::new();
        let err = apply_vm_flags(&mut process, &strings(&["--harmony"])).unwrap_err();
        assert_eq!(err, FlagError::Unsupported("--harmony".to_string()));
    }
}
