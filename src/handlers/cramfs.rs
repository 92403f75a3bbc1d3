use color_eyre::Result;
use serde::{Deserialize, Serialize};

use crate::exec;
use crate::handlers::{finalize_size, split_args, Handler};
use crate::image::{Child, Context, Image};

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct CramfsOpts {
	pub extraargs: Option<String>,
}

pub struct Cramfs {
	opts: CramfsOpts,
}

impl Cramfs {
	#[must_use]
	pub fn new(opts: CramfsOpts) -> Self {
		Self { opts }
	}
}

impl Handler for Cramfs {
	fn ty(&self) -> &'static str {
		"cramfs"
	}

	fn generate(&self, ctx: &Context, image: &mut Image, _children: &[Option<Child>]) -> Result<()> {
		let src = image.srcdir()?;
		let mut cmd = exec::tool(ctx.opts.tool("mkcramfs"));
		if let Some(name) = &image.name {
			cmd.args(["-n", name]);
		}
		cmd.args(split_args(&self.opts.extraargs));
		cmd.arg(src).arg(&image.outfile);
		exec::run(&mut cmd)?;
		finalize_size(image)
	}
}
