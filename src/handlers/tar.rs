use color_eyre::Result;
use serde::{Deserialize, Serialize};

use crate::exec;
use crate::handlers::{finalize_size, Handler};
use crate::image::{Child, Context, Image};

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct TarOpts {}

pub struct Tar {
	#[allow(dead_code)]
	opts: TarOpts,
}

impl Tar {
	#[must_use]
	pub fn new(opts: TarOpts) -> Self {
		Self { opts }
	}
}

/// tar mode letters chosen by the output file name.
fn compression_flag(file: &str) -> &'static str {
	if file.contains(".tar.gz") || file.contains("tgz") {
		"z"
	} else if file.contains(".tar.bz2") {
		"j"
	} else if file.contains(".tar.xz") {
		"J"
	} else {
		""
	}
}

impl Handler for Tar {
	fn ty(&self) -> &'static str {
		"tar"
	}

	fn generate(&self, ctx: &Context, image: &mut Image, _children: &[Option<Child>]) -> Result<()> {
		let src = image.srcdir()?;
		let mode = format!("c{}", compression_flag(&image.file));
		let mut cmd = exec::tool(ctx.opts.tool("tar"));
		cmd.arg(mode).arg("-f").arg(&image.outfile).arg("-C").arg(src).arg(".");
		exec::run(&mut cmd)?;
		finalize_size(image)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn compression_by_extension() {
		assert_eq!(compression_flag("root.tar"), "");
		assert_eq!(compression_flag("root.tar.gz"), "z");
		assert_eq!(compression_flag("root.tgz"), "z");
		assert_eq!(compression_flag("root.tar.bz2"), "j");
		assert_eq!(compression_flag("root.tar.xz"), "J");
	}
}
