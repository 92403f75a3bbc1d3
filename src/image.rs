//! Image records and the dependency walk.
//!
//! Every `image` section becomes one [`Image`]; partitions referencing other
//! images form the dependency edges. Setup and generate are depth-first
//! recursions that visit children before the parent, with per-phase markers
//! for cycle detection and idempotent re-entry.

use std::cell::RefCell;
use std::path::{Path, PathBuf};

use color_eyre::{
	eyre::{bail, eyre, WrapErr},
	Result,
};
use indexmap::IndexMap;
use tracing::{debug, info};

use crate::config::{parse_extent, Config, FlashSpec};
use crate::handlers::{self, Handler};
use crate::io::Extent;
use crate::opts::Opts;
use crate::{exec, util};

/// Everything handlers need besides the image itself: resolved options,
/// flash geometries and the cross-image scratch space.
pub struct Context {
	pub opts: Opts,
	pub flash_types: IndexMap<String, FlashSpec>,
	pub mdraid: RefCell<crate::handlers::mdraid::Shared>,
}

impl std::fmt::Debug for Context {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Context").field("flash_types", &self.flash_types).finish_non_exhaustive()
	}
}

impl Context {
	/// The flash geometry attached to `image`, required by MTD handlers.
	pub fn flash_type(&self, image: &Image) -> Result<&FlashSpec> {
		let name = image
			.flash_type
			.as_deref()
			.ok_or_else(|| eyre!("{}: no flash type given", image.tag()))?;
		self.flash_types.get(name).ok_or_else(|| eyre!("{}: unknown flash type '{name}'", image.tag()))
	}
}

#[derive(Debug, Clone, Default)]
pub struct Partition {
	pub name: String,
	pub image: Option<String>,
	pub offset: u64,
	pub size: u64,
	pub align: u64,
	pub partition_type: u8,
	pub partition_type_uuid: Option<String>,
	pub partition_uuid: Option<String>,
	pub bootable: bool,
	pub read_only: bool,
	pub hidden: bool,
	pub no_automount: bool,
	pub fill: bool,
	pub in_partition_table: bool,
	pub autoresize: bool,
	pub forced_primary: bool,
	/// Computed: lives inside an MBR extended partition.
	pub logical: bool,
	/// Byte offset into the source image (rauc file entries).
	pub imageoffset: u64,
}

impl Partition {
	pub fn end(&self) -> u64 {
		self.offset + self.size
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Walk {
	#[default]
	Unvisited,
	OnStack,
	Done,
}

/// A lightweight view of a partition's child image, handed to handler hooks
/// so they never need the image map itself.
#[derive(Debug, Clone)]
pub struct Child {
	pub file: String,
	pub size: u64,
	pub outfile: PathBuf,
	pub holes: Vec<Extent>,
}

pub struct Image {
	/// Output file name; the section title.
	pub file: String,
	pub name: Option<String>,
	pub size: u64,
	/// Pending percentage, resolved against the source directory at setup.
	pub size_percent: Option<u64>,
	/// Byte ranges overlapping partitions may legitimately overwrite.
	pub holes: Vec<Extent>,
	/// Virtual path below the root tree; `None` means the root itself.
	pub mountpoint: Option<String>,
	pub srcpath: Option<PathBuf>,
	pub empty: bool,
	pub temporary: bool,
	pub exec_pre: Option<String>,
	pub exec_post: Option<String>,
	pub flash_type: Option<String>,
	pub partitions: Vec<Partition>,
	pub handler: Option<Box<dyn Handler>>,
	pub outfile: PathBuf,
	/// Effective source directory, filled in by mountpoint staging.
	pub srcdir: Option<PathBuf>,
	setup_mark: Walk,
	generate_mark: Walk,
}

impl std::fmt::Debug for Image {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Image")
			.field("file", &self.file)
			.field("name", &self.name)
			.field("size", &self.size)
			.field("size_percent", &self.size_percent)
			.field("holes", &self.holes)
			.field("mountpoint", &self.mountpoint)
			.field("srcpath", &self.srcpath)
			.field("empty", &self.empty)
			.field("temporary", &self.temporary)
			.field("exec_pre", &self.exec_pre)
			.field("exec_post", &self.exec_post)
			.field("flash_type", &self.flash_type)
			.field("partitions", &self.partitions)
			.field("outfile", &self.outfile)
			.field("srcdir", &self.srcdir)
			.field("setup_mark", &self.setup_mark)
			.field("generate_mark", &self.generate_mark)
			.finish_non_exhaustive()
	}
}

impl Image {
	/// An empty record; the parser (and tests) fill the fields in.
	#[must_use]
	pub fn blank() -> Self {
		Self {
			file: String::new(),
			name: None,
			size: 0,
			size_percent: None,
			holes: Vec::new(),
			mountpoint: None,
			srcpath: None,
			empty: false,
			temporary: false,
			exec_pre: None,
			exec_post: None,
			flash_type: None,
			partitions: Vec::new(),
			handler: None,
			outfile: PathBuf::new(),
			srcdir: None,
			setup_mark: Walk::default(),
			generate_mark: Walk::default(),
		}
	}

	/// `type(file)` prefix for diagnostics.
	pub fn tag(&self) -> String {
		let ty = self.handler.as_ref().map_or("unknown", |h| h.ty());
		format!("{ty}({})", self.file)
	}

	/// The directory this image is built from.
	pub fn srcdir(&self) -> Result<&Path> {
		self.srcdir.as_deref().ok_or_else(|| eyre!("{}: no source directory", self.tag()))
	}

	pub fn no_rootpath(&self) -> bool {
		self.handler.as_ref().is_some_and(|h| h.no_rootpath())
	}
}

#[derive(Debug)]
pub struct Build {
	pub ctx: Context,
	pub images: IndexMap<String, Image>,
}

impl Build {
	/// Materialize the image list from the parsed configuration: attach
	/// handlers, run their parse hooks, synthesize implicit `file` children
	/// and propagate flash types.
	pub fn from_config(opts: Opts, cfg: &Config) -> Result<Self> {
		let ctx = Context {
			opts,
			flash_types: cfg.flash.clone(),
			mdraid: RefCell::default(),
		};
		let mut images: IndexMap<String, Image> = IndexMap::new();
		// partition-declared holes, applied to the referenced image below
		let mut pending_holes: Vec<(String, Extent)> = Vec::new();

		for (file, spec) in &cfg.image {
			let mut handler = handlers::attach(file, spec)?;

			if spec.mountpoint.is_some() && spec.srcpath.is_some() {
				bail!("{}({file}): 'mountpoint' and 'srcpath' are mutually exclusive", handler.ty());
			}
			if let Some(ft) = &spec.flashtype {
				if !ctx.flash_types.contains_key(ft) {
					bail!("{}({file}): unknown flash type '{ft}'", handler.ty());
				}
			}

			let mut partitions = Vec::new();
			for (pname, p) in &spec.partition {
				if p.size.percent || p.offset.percent || p.align.percent {
					bail!("{}({file}): partition {pname}: percent sizes are not allowed here", handler.ty());
				}
				for hole in &p.holes {
					let Some(child) = &p.image else {
						bail!("{}({file}): partition {pname}: holes require an image", handler.ty());
					};
					let (start, end) = parse_extent(hole)?;
					pending_holes.push((child.clone(), Extent { start, end }));
				}
				partitions.push(Partition {
					name: pname.clone(),
					image: p.image.clone(),
					offset: p.offset.bytes,
					size: p.size.bytes,
					align: p.align.bytes,
					partition_type: p.partition_type,
					partition_type_uuid: p.partition_type_uuid.clone(),
					partition_uuid: p.partition_uuid.clone(),
					bootable: p.bootable,
					read_only: p.read_only,
					hidden: p.hidden,
					no_automount: p.no_automount,
					fill: p.fill,
					in_partition_table: p.in_partition_table,
					autoresize: p.autoresize,
					forced_primary: p.forced_primary,
					..Partition::default()
				});
			}

			let outdir =
				if spec.temporary { ctx.opts.tmppath() } else { ctx.opts.imagepath() };
			let mut image = Image {
				file: file.clone(),
				name: spec.name.clone(),
				size: if spec.size.percent { 0 } else { spec.size.bytes },
				size_percent: spec.size.percent.then_some(spec.size.bytes),
				holes: Vec::new(),
				mountpoint: spec.mountpoint.as_deref().map(|m| m.trim_start_matches('/').to_owned()),
				srcpath: spec.srcpath.as_deref().map(PathBuf::from),
				empty: spec.empty,
				temporary: spec.temporary,
				exec_pre: spec.exec_pre.clone(),
				exec_post: spec.exec_post.clone(),
				flash_type: spec.flashtype.clone(),
				partitions,
				handler: None,
				outfile: outdir.join(file),
				srcdir: None,
				setup_mark: Walk::default(),
				generate_mark: Walk::default(),
			};
			handler.parse(&mut image)?;
			image.handler = Some(handler);
			images.insert(file.clone(), image);
		}

		// every partition needs a corresponding image; missing ones become
		// implicit file children
		let mut implicit = Vec::new();
		for image in images.values() {
			for part in &image.partitions {
				match &part.image {
					None if part.in_partition_table => {},
					None => bail!("{}: partition {}: no input file given", image.tag(), part.name),
					Some(child) => {
						if !images.contains_key(child) && !implicit.contains(child) {
							debug!("{}: adding implicit file rule for '{child}'", image.tag());
							implicit.push(child.clone());
						}
					},
				}
			}
		}
		for file in implicit {
			let image = Image {
				file: file.clone(),
				name: None,
				size: 0,
				size_percent: None,
				holes: Vec::new(),
				mountpoint: None,
				srcpath: None,
				empty: false,
				temporary: false,
				exec_pre: None,
				exec_post: None,
				flash_type: None,
				partitions: Vec::new(),
				handler: Some(handlers::implicit_file()),
				outfile: ctx.opts.imagepath().join(&file),
				srcdir: None,
				setup_mark: Walk::default(),
				generate_mark: Walk::default(),
			};
			images.insert(file, image);
		}

		for (file, extent) in pending_holes {
			images
				.get_mut(&file)
				.ok_or_else(|| eyre!("could not find '{file}'"))?
				.holes
				.push(extent);
		}
		for image in images.values_mut() {
			image.holes.sort_by_key(|e| e.start);
		}

		let mut build = Self { ctx, images };
		build.propagate_flash_types()?;
		Ok(build)
	}

	/// Any image with a flash type imposes it on every image referenced by
	/// its partitions; conflicts are fatal. Runs to a fixpoint so chains
	/// (flash → ubi → ubifs) inherit transitively.
	fn propagate_flash_types(&mut self) -> Result<()> {
		loop {
			let mut changed = false;
			for idx in 0..self.images.len() {
				let Some(ft) = self.images[idx].flash_type.clone() else { continue };
				let parent = self.images[idx].file.clone();
				let children: Vec<String> =
					self.images[idx].partitions.iter().filter_map(|p| p.image.clone()).collect();
				for name in children {
					let child = self
						.images
						.get_mut(&name)
						.ok_or_else(|| eyre!("could not find '{name}'"))?;
					match &child.flash_type {
						None => {
							child.flash_type = Some(ft.clone());
							changed = true;
						},
						Some(existing) if *existing != ft => {
							bail!(
								"conflicting flash types: {} has flashtype {existing} whereas {parent} has flashtype {ft}",
								child.file
							);
						},
						Some(_) => {},
					}
				}
			}
			if !changed {
				return Ok(());
			}
		}
	}

	fn children(&self, idx: usize) -> Result<Vec<Option<Child>>> {
		let image = &self.images[idx];
		image
			.partitions
			.iter()
			.map(|p| {
				p.image
					.as_ref()
					.map(|name| {
						let child = self
							.images
							.get(name)
							.ok_or_else(|| eyre!("{}: could not find '{name}'", image.tag()))?;
						Ok(Child {
							file: child.file.clone(),
							size: child.size,
							outfile: child.outfile.clone(),
							holes: child.holes.clone(),
						})
					})
					.transpose()
			})
			.collect()
	}

	fn child_indices(&self, idx: usize) -> Result<Vec<usize>> {
		let image = &self.images[idx];
		image
			.partitions
			.iter()
			.filter_map(|p| p.image.as_ref())
			.map(|name| {
				self.images
					.get_index_of(name)
					.ok_or_else(|| eyre!("{}: could not find '{name}'", image.tag()))
			})
			.collect()
	}

	pub fn setup_all(&mut self) -> Result<()> {
		for idx in 0..self.images.len() {
			self.setup(idx)?;
		}
		Ok(())
	}

	fn setup(&mut self, idx: usize) -> Result<()> {
		match self.images[idx].setup_mark {
			Walk::Done => return Ok(()),
			Walk::OnStack => bail!("{}: recursive dependency detected", self.images[idx].tag()),
			Walk::Unvisited => self.images[idx].setup_mark = Walk::OnStack,
		}

		for cidx in self.child_indices(idx)? {
			self.setup(cidx).wrap_err_with(|| {
				format!("{}: could not setup dependencies", self.images[idx].tag())
			})?;
		}

		self.resolve_percent_size(idx)?;

		let children = self.children(idx)?;
		let Self { ctx, images } = self;
		let image = &mut images[idx];
		let mut handler = image.handler.take().ok_or_else(|| eyre!("no handler"))?;
		let ret = handler.setup(ctx, image, &children);
		image.handler = Some(handler);
		ret.wrap_err_with(|| format!("could not setup {}", self.images[idx].file))?;

		self.images[idx].setup_mark = Walk::Done;
		Ok(())
	}

	/// Percent sizes resolve against the original source tree (identical in
	/// content to the staging copy, which does not exist yet at setup time).
	fn resolve_percent_size(&mut self, idx: usize) -> Result<()> {
		let image = &self.images[idx];
		let Some(percent) = image.size_percent else { return Ok(()) };
		let base = if let Some(src) = &image.srcpath {
			src.clone()
		} else {
			let root = self
				.ctx
				.opts
				.rootpath()
				.ok_or_else(|| eyre!("{}: percent size without a root tree", image.tag()))?;
			match &image.mountpoint {
				Some(mp) if !mp.is_empty() => root.join(mp),
				_ => root.to_path_buf(),
			}
		};
		let dirsize = util::dir_size(&base)?;
		let size = dirsize * percent / 100;
		debug!(
			"{}: resolved size {percent}% of {} to {size} bytes",
			self.images[idx].tag(),
			base.display()
		);
		self.images[idx].size = size;
		Ok(())
	}

	pub fn generate_all(&mut self) -> Result<()> {
		for idx in 0..self.images.len() {
			self.generate(idx)?;
		}
		Ok(())
	}

	fn generate(&mut self, idx: usize) -> Result<()> {
		match self.images[idx].generate_mark {
			Walk::Done => return Ok(()),
			Walk::OnStack => bail!("{}: recursive dependency detected", self.images[idx].tag()),
			Walk::Unvisited => self.images[idx].generate_mark = Walk::OnStack,
		}

		for cidx in self.child_indices(idx)? {
			self.generate(cidx).wrap_err_with(|| {
				format!("{}: could not generate dependencies", self.images[idx].tag())
			})?;
		}

		let children = self.children(idx)?;
		self.setenv_image(idx);

		if let Some(pre) = self.images[idx].exec_pre.clone() {
			exec::run_script(&pre)
				.wrap_err_with(|| format!("{}: exec-pre failed", self.images[idx].tag()))?;
		}

		info!(
			"generating {} ({})",
			self.images[idx].tag(),
			bytesize::ByteSize::b(self.images[idx].size)
		);
		let Self { ctx, images } = self;
		let image = &mut images[idx];
		let handler = image.handler.take().ok_or_else(|| eyre!("no handler"))?;
		let ret = handler.generate(ctx, image, &children);
		image.handler = Some(handler);
		if let Err(e) = ret {
			self.remove_failed_output(idx);
			return Err(e.wrap_err(format!("failed to generate {}", self.images[idx].file)));
		}

		if let Some(post) = self.images[idx].exec_post.clone() {
			exec::run_script(&post)
				.wrap_err_with(|| format!("{}: exec-post failed", self.images[idx].tag()))?;
		}

		self.images[idx].generate_mark = Walk::Done;
		Ok(())
	}

	/// The per-image environment contract for hooks and handler tools.
	fn setenv_image(&self, idx: usize) {
		let image = &self.images[idx];
		std::env::set_var("IMAGE", &image.file);
		std::env::set_var("IMAGEOUTFILE", &image.outfile);
		std::env::set_var("IMAGENAME", image.name.as_deref().unwrap_or(""));
		std::env::set_var("IMAGESIZE", image.size.to_string());
		std::env::set_var("IMAGEMOUNTPOINT", image.mountpoint.as_deref().unwrap_or(""));
		std::env::set_var(
			"IMAGEMOUNTPATH",
			image.srcdir.as_deref().unwrap_or_else(|| Path::new("")),
		);
	}

	/// A failed generate leaves no half-written output behind, but only
	/// regular files and symlinks are removed; block devices stay.
	fn remove_failed_output(&self, idx: usize) {
		let outfile = &self.images[idx].outfile;
		if let Ok(meta) = std::fs::symlink_metadata(outfile) {
			if meta.file_type().is_file() || meta.file_type().is_symlink() {
				let _ = std::fs::remove_file(outfile);
			}
		}
	}
}
