//! Child-process plumbing.
//!
//! External tools are always invoked with structured argument vectors, never
//! through a shell. Only the user-supplied `exec-pre`/`exec-post` hooks go
//! through `sh -c`, because they are scripts by contract.

use std::ffi::OsStr;
use std::process::{Command, Stdio};

use color_eyre::{
	eyre::{bail, eyre},
	Help, Result, SectionExt,
};
use itertools::Itertools;
use lazy_format::lazy_format as lzf;
use tracing::debug;

fn render(cmd: &Command) -> String {
	std::iter::once(cmd.get_program())
		.chain(cmd.get_args())
		.map(|a| a.to_string_lossy())
		.join(" ")
}

/// Build a [`Command`] for an external tool.
pub fn tool<S: AsRef<OsStr>>(name: S) -> Command {
	Command::new(name.as_ref())
}

fn check(cmd: &Command, out: std::process::Output) -> Result<Vec<u8>> {
	if out.status.success() {
		return Ok(out.stdout);
	}
	let stdout = String::from_utf8_lossy(&out.stdout).trim().to_owned();
	let stderr = String::from_utf8_lossy(&out.stderr).trim().to_owned();
	Err(eyre!("command '{}' failed: {}", render(cmd), out.status)
		.with_section(move || stdout.header("Stdout:"))
		.with_section(move || stderr.header("Stderr:")))
}

/// Run a prepared command to completion, capturing its output. Returns
/// stdout on success; a non-zero exit becomes an error carrying both
/// captured streams.
pub fn run(cmd: &mut Command) -> Result<Vec<u8>> {
	debug!("cmd: {}", render(cmd));
	let out = cmd.output().map_err(|e| eyre!("spawn '{}': {e}", render(cmd)))?;
	check(cmd, out)
}

/// Like [`run`], feeding `input` to the child's stdin.
pub fn run_with_stdin(cmd: &mut Command, input: &[u8]) -> Result<Vec<u8>> {
	use std::io::Write;

	debug!("cmd: {} (with stdin)", render(cmd));
	cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
	let mut child = cmd.spawn().map_err(|e| eyre!("spawn '{}': {e}", render(cmd)))?;
	child
		.stdin
		.take()
		.ok_or_else(|| eyre!("no stdin handle for '{}'", render(cmd)))?
		.write_all(input)?;
	let out = child.wait_with_output()?;
	check(cmd, out)
}

/// Run `first | second`, with `second`'s stdout captured.
pub fn pipeline(first: &mut Command, second: &mut Command) -> Result<Vec<u8>> {
	debug!("cmd: {} | {}", render(first), render(second));
	first.stdout(Stdio::piped()).stderr(Stdio::piped());
	let mut producer = first.spawn().map_err(|e| eyre!("spawn '{}': {e}", render(first)))?;
	let upstream =
		producer.stdout.take().ok_or_else(|| eyre!("no stdout handle for '{}'", render(first)))?;
	second.stdin(Stdio::from(upstream)).stdout(Stdio::piped()).stderr(Stdio::piped());
	let consumer = second.spawn().map_err(|e| eyre!("spawn '{}': {e}", render(second)))?;

	let first_out = producer.wait_with_output()?;
	let out = consumer.wait_with_output()?;
	if !first_out.status.success() {
		check(first, first_out)?;
	}
	check(second, out)
}

/// Like [`run`], but treating the listed exit codes as success.
pub fn run_ok_codes(cmd: &mut Command, ok: &[i32]) -> Result<Vec<u8>> {
	debug!("cmd: {}", render(cmd));
	let out = cmd.output().map_err(|e| eyre!("spawn '{}': {e}", render(cmd)))?;
	if out.status.code().is_some_and(|c| ok.contains(&c)) {
		return Ok(out.stdout);
	}
	check(cmd, out)
}

/// Run a command with its stdout streamed into `outfile` (avoids buffering
/// archive payloads in memory). `input`, when given, is fed to stdin.
pub fn run_to_file(cmd: &mut Command, input: Option<&[u8]>, outfile: &std::path::Path) -> Result<()> {
	use std::io::Write;

	debug!("cmd: {} > {}", render(cmd), outfile.display());
	let out = std::fs::File::create(outfile)?;
	cmd.stdout(Stdio::from(out)).stderr(Stdio::piped());
	if input.is_some() {
		cmd.stdin(Stdio::piped());
	}
	let mut child = cmd.spawn().map_err(|e| eyre!("spawn '{}': {e}", render(cmd)))?;
	if let Some(input) = input {
		child
			.stdin
			.take()
			.ok_or_else(|| eyre!("no stdin handle for '{}'", render(cmd)))?
			.write_all(input)?;
	}
	let out = child.wait_with_output()?;
	check(cmd, out).map(drop)
}

/// Run `first | second > outfile`, feeding `input` to `first`'s stdin.
pub fn pipeline_to_file(
	first: &mut Command, input: Option<&[u8]>, second: &mut Command,
	outfile: &std::path::Path,
) -> Result<()> {
	use std::io::Write;

	debug!("cmd: {} | {} > {}", render(first), render(second), outfile.display());
	first.stdout(Stdio::piped()).stderr(Stdio::piped());
	if input.is_some() {
		first.stdin(Stdio::piped());
	}
	let mut producer = first.spawn().map_err(|e| eyre!("spawn '{}': {e}", render(first)))?;
	if let Some(input) = input {
		producer
			.stdin
			.take()
			.ok_or_else(|| eyre!("no stdin handle for '{}'", render(first)))?
			.write_all(input)?;
	}
	let upstream =
		producer.stdout.take().ok_or_else(|| eyre!("no stdout handle for '{}'", render(first)))?;
	let out = std::fs::File::create(outfile)?;
	second.stdin(Stdio::from(upstream)).stdout(Stdio::from(out)).stderr(Stdio::piped());
	let consumer = second.spawn().map_err(|e| eyre!("spawn '{}': {e}", render(second)))?;

	let first_out = producer.wait_with_output()?;
	let second_out = consumer.wait_with_output()?;
	if !first_out.status.success() {
		check(first, first_out)?;
	}
	check(second, second_out).map(drop)
}

/// Run a user-supplied hook script through `sh -c`, inheriting our stdio so
/// the script can talk to the terminal.
pub fn run_script(script: &str) -> Result<()> {
	debug!("cmd: sh -c {script:?}");
	let status = Command::new("sh").arg("-c").arg(script).status()?;
	if !status.success() {
		return Err(eyre!("hook script exited with {status}")
			.note(lzf!("script: {script}").to_string()));
	}
	Ok(())
}

/// Recursive copy preserving permissions, ownership, timestamps and
/// symlinks. `cp -a` does exactly this and handles every corner (sockets,
/// hard links, sparse files); there is no point reimplementing it.
pub fn copy_tree(src: &std::path::Path, dst: &std::path::Path) -> Result<()> {
	run(tool("cp").arg("-a").arg(src).arg(dst)).map(drop)
}

/// Rename across the staging tree (same filesystem by construction).
pub fn move_tree(src: &std::path::Path, dst: &std::path::Path) -> Result<()> {
	if let Err(e) = std::fs::rename(src, dst) {
		bail!("mv {} {}: {e}", src.display(), dst.display());
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn captures_stdout() {
		let out = run(tool("echo").arg("hello")).unwrap();
		assert_eq!(out, b"hello\n");
	}

	#[test]
	fn nonzero_exit_is_error() {
		assert!(run(&mut tool("false")).is_err());
	}

	#[test]
	fn stdin_roundtrip() {
		let out = run_with_stdin(&mut tool("cat"), b"abc").unwrap();
		assert_eq!(out, b"abc");
	}

	#[test]
	fn pipeline_chains() {
		let out = pipeline(tool("echo").arg("a\nb\na"), &mut tool("sort")).unwrap();
		assert_eq!(out, b"a\na\nb\n");
	}

	#[test]
	fn script_runs_through_sh() {
		assert!(run_script("true").is_ok());
		assert!(run_script("exit 3").is_err());
	}
}
