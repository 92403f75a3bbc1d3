use color_eyre::{eyre::bail, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::exec;
use crate::handlers::{child, split_args, Handler};
use crate::image::{Child, Context, Image, Partition};
use crate::io;

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct VfatFileSpec {
	pub image: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct VfatOpts {
	pub extraargs: Option<String>,
	pub label: Option<String>,
	/// Images copied to the filesystem root, keeping their names.
	#[serde(default)]
	pub files: Vec<String>,
	/// Images copied to an explicit target path (the section title).
	#[serde(default)]
	pub file: IndexMap<String, VfatFileSpec>,
}

pub struct Vfat {
	opts: VfatOpts,
}

impl Vfat {
	#[must_use]
	pub fn new(opts: VfatOpts) -> Self {
		Self { opts }
	}
}

impl Handler for Vfat {
	fn ty(&self) -> &'static str {
		"vfat"
	}

	fn parse(&mut self, image: &mut Image) -> Result<()> {
		for (target, spec) in &self.opts.file {
			image.partitions.push(Partition {
				name: target.clone(),
				image: Some(spec.image.clone()),
				in_partition_table: false,
				..Partition::default()
			});
		}
		for entry in &self.opts.files {
			image.partitions.push(Partition {
				name: String::new(),
				image: Some(entry.clone()),
				in_partition_table: false,
				..Partition::default()
			});
		}
		Ok(())
	}

	fn setup(&mut self, _ctx: &Context, image: &mut Image, _children: &[Option<Child>]) -> Result<()> {
		if image.size == 0 {
			bail!("{}: no size given or must not be zero", image.tag());
		}
		Ok(())
	}

	fn generate(&self, ctx: &Context, image: &mut Image, children: &[Option<Child>]) -> Result<()> {
		io::prepare_image(&image.outfile, image.size)?;

		let mut mkdosfs = exec::tool(ctx.opts.tool("mkdosfs"));
		mkdosfs.args(split_args(&self.opts.extraargs));
		if let Some(label) = &self.opts.label {
			mkdosfs.args(["-n", label]);
		}
		mkdosfs.arg(&image.outfile);
		exec::run(&mut mkdosfs)?;

		for part in &image.partitions {
			let Some(name) = &part.image else { continue };
			let source = child(image, children, name)?;
			let target = if part.name.is_empty() { source.file.clone() } else { part.name.clone() };

			// create intermediate directories; mmd fails when one exists,
			// which is fine
			let mut path = String::new();
			for dir in target.split('/').rev().skip(1).collect::<Vec<_>>().into_iter().rev() {
				if !path.is_empty() {
					path.push('/');
				}
				path.push_str(dir);
				let _ = exec::run(
					exec::tool(ctx.opts.tool("mmd"))
						.args(["-DsS", "-i"])
						.arg(&image.outfile)
						.arg(format!("::{path}")),
				);
			}

			tracing::info!("{}: adding file '{}' as '{target}'", image.tag(), source.file);
			exec::run(
				exec::tool(ctx.opts.tool("mcopy"))
					.args(["-bsp", "-i"])
					.arg(&image.outfile)
					.arg(&source.outfile)
					.arg(format!("::{target}")),
			)?;
		}
		if !image.partitions.is_empty() {
			return Ok(());
		}

		// no explicit file list: copy the whole source tree
		let src = image.srcdir()?;
		let entries: Vec<_> =
			std::fs::read_dir(src)?.filter_map(|e| e.ok().map(|e| e.path())).collect();
		if entries.is_empty() {
			return Ok(());
		}
		let mut mcopy = exec::tool(ctx.opts.tool("mcopy"));
		mcopy.args(["-bsp", "-i"]).arg(&image.outfile).args(&entries).arg("::");
		exec::run(&mut mcopy).map(drop)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn file_entries_become_dependencies() {
		let mut opts = VfatOpts::default();
		opts.file.insert("boot/vmlinuz".to_owned(), VfatFileSpec { image: "kernel".to_owned() });
		opts.files.push("initrd".to_owned());
		let mut image = Image::blank();
		let mut h = Vfat::new(opts);
		h.parse(&mut image).unwrap();
		assert_eq!(image.partitions.len(), 2);
		assert_eq!(image.partitions[0].name, "boot/vmlinuz");
		assert_eq!(image.partitions[0].image.as_deref(), Some("kernel"));
		assert_eq!(image.partitions[1].name, "");
		assert_eq!(image.partitions[1].image.as_deref(), Some("initrd"));
	}
}
