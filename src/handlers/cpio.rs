use std::path::Path;

use color_eyre::Result;
use serde::{Deserialize, Serialize};

use crate::exec;
use crate::handlers::{finalize_size, split_args, Handler};
use crate::image::{Child, Context, Image};

fn default_format() -> String {
	"newc".to_owned()
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct CpioOpts {
	#[serde(default = "default_format")]
	pub format: String,
	pub extraargs: Option<String>,
	/// Compressor command the archive is piped through (e.g. "gzip -9").
	pub compress: Option<String>,
}

impl Default for CpioOpts {
	fn default() -> Self {
		Self { format: default_format(), extraargs: None, compress: None }
	}
}

pub struct Cpio {
	opts: CpioOpts,
}

impl Cpio {
	#[must_use]
	pub fn new(opts: CpioOpts) -> Self {
		Self { opts }
	}
}

/// Relative paths of everything below `dir`, the way `find .` lists them.
fn file_list(dir: &Path, prefix: &str, acc: &mut Vec<String>) -> Result<()> {
	for entry in std::fs::read_dir(dir)? {
		let entry = entry?;
		let name = entry.file_name();
		let rel = format!("{prefix}/{}", name.to_string_lossy());
		acc.push(rel.clone());
		if entry.file_type()?.is_dir() {
			file_list(&entry.path(), &rel, acc)?;
		}
	}
	Ok(())
}

impl Handler for Cpio {
	fn ty(&self) -> &'static str {
		"cpio"
	}

	fn generate(&self, ctx: &Context, image: &mut Image, _children: &[Option<Child>]) -> Result<()> {
		let src = image.srcdir()?;
		let mut paths = vec![".".to_owned()];
		file_list(src, ".", &mut paths)?;
		let input = paths.join("\n").into_bytes();

		let mut cpio = exec::tool(ctx.opts.tool("cpio"));
		cpio.current_dir(src)
			.args(["-H", &self.opts.format])
			.args(split_args(&self.opts.extraargs))
			.arg("-o");

		let mut words =
			self.opts.compress.as_deref().unwrap_or_default().split_whitespace();
		match words.next() {
			Some(program) => {
				let mut compressor = exec::tool(program);
				compressor.args(words);
				exec::pipeline_to_file(&mut cpio, Some(&input), &mut compressor, &image.outfile)?;
			},
			None => exec::run_to_file(&mut cpio, Some(&input), &image.outfile)?,
		}
		finalize_size(image)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn file_list_is_recursive_and_dot_relative() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::create_dir(dir.path().join("bin")).unwrap();
		std::fs::write(dir.path().join("bin/sh"), b"").unwrap();
		std::fs::write(dir.path().join("init"), b"").unwrap();
		let mut paths = Vec::new();
		file_list(dir.path(), ".", &mut paths).unwrap();
		paths.sort();
		assert_eq!(paths, vec!["./bin", "./bin/sh", "./init"]);
	}
}
