use color_eyre::{eyre::bail, Result};
use serde::{Deserialize, Serialize};

use crate::exec;
use crate::handlers::{child, finalize_size, split_args, Handler};
use crate::image::{Child, Context, Image};

fn default_format() -> String {
	"qcow2".to_owned()
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct QemuOpts {
	#[serde(default = "default_format")]
	pub format: String,
	pub extraargs: Option<String>,
}

impl Default for QemuOpts {
	fn default() -> Self {
		Self { format: default_format(), extraargs: None }
	}
}

pub struct Qemu {
	opts: QemuOpts,
}

impl Qemu {
	#[must_use]
	pub fn new(opts: QemuOpts) -> Self {
		Self { opts }
	}
}

impl Handler for Qemu {
	fn ty(&self) -> &'static str {
		"qemu"
	}

	fn no_rootpath(&self) -> bool {
		true
	}

	fn setup(&mut self, _ctx: &Context, image: &mut Image, _children: &[Option<Child>]) -> Result<()> {
		if !image.partitions.iter().any(|p| p.image.is_some()) {
			bail!("{}: no partition given", image.tag());
		}
		Ok(())
	}

	fn generate(&self, ctx: &Context, image: &mut Image, children: &[Option<Child>]) -> Result<()> {
		let mut cmd = exec::tool(ctx.opts.tool("qemu-img"));
		cmd.arg("convert").args(split_args(&self.opts.extraargs)).args(["-O", &self.opts.format]);
		for part in &image.partitions {
			let Some(name) = &part.image else {
				tracing::debug!("{}: skipping partition {}", image.tag(), part.name);
				continue;
			};
			cmd.arg(&child(image, children, name)?.outfile);
		}
		cmd.arg(&image.outfile);
		exec::run(&mut cmd)?;
		finalize_size(image)
	}
}
