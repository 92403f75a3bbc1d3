use std::fmt::Write as _;

use color_eyre::{eyre::bail, Result};
use serde::{Deserialize, Serialize};

use crate::exec;
use crate::handlers::{child, finalize_size, Handler};
use crate::image::{Child, Context, Image, Partition};

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct FitOpts {
	/// The image tree source; binaries referenced by partitions are
	/// appended as /incbin/ nodes.
	#[serde(default)]
	pub its: String,
	pub keydir: Option<String>,
}

pub struct Fit {
	opts: FitOpts,
}

impl Fit {
	#[must_use]
	pub fn new(opts: FitOpts) -> Self {
		Self { opts }
	}
}

impl Handler for Fit {
	fn ty(&self) -> &'static str {
		"fit"
	}

	fn no_rootpath(&self) -> bool {
		true
	}

	fn parse(&mut self, image: &mut Image) -> Result<()> {
		image.partitions.push(Partition {
			name: "its".to_owned(),
			image: Some(self.opts.its.clone()),
			in_partition_table: false,
			..Partition::default()
		});
		Ok(())
	}

	fn generate(&self, ctx: &Context, image: &mut Image, children: &[Option<Child>]) -> Result<()> {
		let its_part = image
			.partitions
			.iter()
			.find(|p| p.name == "its")
			.ok_or_else(|| color_eyre::eyre::eyre!("{}: no its given", image.tag()))?;
		let its_child = child(image, children, its_part.image.as_deref().unwrap_or_default())?;

		// working copy of the its with the data nodes appended
		let mut its = std::fs::read_to_string(&its_child.outfile)?;
		its.push('\n');
		for part in &image.partitions {
			if part.name == "its" {
				continue;
			}
			let Some(name) = &part.image else { continue };
			let source = child(image, children, name)?;
			writeln!(
				its,
				"/ {{ images {{ {} {{ data = /incbin/(\"{}\"); }};}};}};",
				part.name,
				source.outfile.display()
			)?;
		}
		let its_path = ctx.opts.tmppath().join("fit.its");
		std::fs::write(&its_path, its)?;

		let mut cmd = exec::tool(ctx.opts.tool("mkimage"));
		cmd.arg("-r");
		if let Some(keydir) = self.opts.keydir.as_deref().filter(|k| !k.is_empty()) {
			if !keydir.starts_with('/') {
				bail!("{}: 'keydir' must be an absolute path", image.tag());
			}
			cmd.args(["-k", keydir]);
		}
		cmd.arg("-f").arg(&its_path).arg(&image.outfile);
		exec::run(&mut cmd)?;
		finalize_size(image)
	}
}
