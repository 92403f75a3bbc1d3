use color_eyre::{eyre::bail, Result};
use serde::{Deserialize, Serialize};

use crate::exec;
use crate::handlers::{split_args, Handler};
use crate::image::{Child, Context, Image};
use crate::io;

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct F2fsOpts {
	pub extraargs: Option<String>,
	pub label: Option<String>,
}

pub struct F2fs {
	opts: F2fsOpts,
}

impl F2fs {
	#[must_use]
	pub fn new(opts: F2fsOpts) -> Self {
		Self { opts }
	}
}

impl Handler for F2fs {
	fn ty(&self) -> &'static str {
		"f2fs"
	}

	fn setup(&mut self, _ctx: &Context, image: &mut Image, _children: &[Option<Child>]) -> Result<()> {
		if image.size == 0 {
			bail!("{}: no size given or must not be zero", image.tag());
		}
		Ok(())
	}

	fn generate(&self, ctx: &Context, image: &mut Image, _children: &[Option<Child>]) -> Result<()> {
		io::prepare_image(&image.outfile, image.size)?;

		let mut mkfs = exec::tool(ctx.opts.tool("mkfsf2fs"));
		if let Some(label) = &self.opts.label {
			mkfs.args(["-l", label]);
		}
		mkfs.args(split_args(&self.opts.extraargs));
		mkfs.arg(&image.outfile);
		exec::run(&mut mkfs)?;

		if let Ok(src) = image.srcdir() {
			exec::run(
				exec::tool(ctx.opts.tool("sloadf2fs")).arg("-f").arg(src).arg(&image.outfile),
			)?;
		}
		Ok(())
	}
}
