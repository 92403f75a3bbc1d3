#![warn(clippy::complexity)]
#![warn(clippy::correctness)]
#![warn(clippy::perf)]
#![warn(clippy::style)]
#![warn(clippy::suspicious)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::format_push_string)]
#![warn(clippy::get_unwrap)]
#![allow(clippy::missing_errors_doc)]

mod config;
mod exec;
mod flash;
mod handlers;
mod hdimage;
mod image;
mod io;
mod opts;
mod staging;
mod util;

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use color_eyre::{eyre::WrapErr, Result};
use tracing::{debug, trace};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

use crate::config::Config;
use crate::image::Build;
use crate::opts::Opts;

fn init_tracing(loglevel: u8) {
	let level = match loglevel {
		0 => "error",
		1 => "info",
		2 => "debug",
		_ => "trace",
	};
	let filter = EnvFilter::new(level);
	let fmtlyr = fmt::layer().with_target(false).with_filter(filter);
	let subscriber = Registry::default().with(tracing_error::ErrorLayer::default()).with(fmtlyr);
	tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

/// The path environment exported to every hook and external tool.
fn setenv_paths(opts: &Opts) {
	std::env::set_var("OUTPUTPATH", opts.imagepath());
	std::env::set_var("INPUTPATH", opts.inputpath());
	std::env::set_var("ROOTPATH", opts.rootpath().unwrap_or_else(|| Path::new("")));
	std::env::set_var("TMPPATH", opts.tmppath());
}

fn main() -> Result<()> {
	if let Err(e) = dotenvy::dotenv() {
		if !e.not_found() {
			return Err(e.into());
		}
	}
	color_eyre::install()?;

	let argv: Vec<OsString> = std::env::args_os().collect();

	// first pass resolves the config file path itself
	let bootstrap = Opts::load(&argv, None)?;
	init_tracing(bootstrap.loglevel());

	let cfgpath = PathBuf::from(bootstrap.get("config").unwrap_or("genimage.cfg"));
	let cfg = Config::load(&cfgpath, &bootstrap.includepath())?;
	trace!(?cfg, "loaded configuration");

	// second pass, now with the config section available
	let opts = Opts::load(&argv, Some(&cfg.opt_section()))?;

	if let Some(dump) = opts.get("configdump") {
		let rendered = hcl::to_string(&cfg).wrap_err("could not render configuration dump")?;
		std::fs::write(dump, rendered)
			.wrap_err_with(|| format!("could not write configuration dump to '{dump}'"))?;
		debug!("wrote configuration dump to {dump}");
	}

	let _tmp = staging::check_tmp(opts.tmppath())?;
	setenv_paths(&opts);

	let mut build = Build::from_config(opts, &cfg)?;
	build.setup_all()?;

	std::fs::create_dir_all(build.ctx.opts.imagepath())
		.wrap_err_with(|| format!("mkdir {}", build.ctx.opts.imagepath().display()))?;
	staging::stage(&mut build)?;

	build.generate_all()?;

	Ok(())
}
