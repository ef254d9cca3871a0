//! Run command - assemble and launch a sandbox

use crate::cli::args::RunArgs;
use crate::config::schema::DefaultsConfig;
use crate::config::Config;
use crate::error::{SbError, SbResult};
use crate::generate::{self, Assembler};
use crate::options::{Features, LibrarySpec, Namespace, SandboxOptions};
use crate::util;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Execute the run command
pub async fn execute(args: RunArgs, config: &Config) -> SbResult<()> {
    let options = build_options(args, &config.defaults)?;
    let assembler = Assembler::from_config(config, options.update);

    let assembly = assembler.cmd(&options).await?;
    info!(
        "Command for {} {} (fingerprint {})",
        options.program,
        if assembly.reused { "reused" } else { "generated" },
        assembly.fingerprint
    );
    let command = generate::full_command(&options, &assembly);

    // Nothing may still be writing to the store once the sandbox starts
    assembler.context().pool().wait().await?;

    let tools = assembler.context().tools();
    if options.dry {
        println!("{} {}", tools.bwrap, util::render_command(&command));
        return Ok(());
    }

    let code = tools.launch(&command).await?;
    debug!("Sandbox exited with {}", code);
    if code != 0 {
        return Err(SbError::SandboxExit(code));
    }
    Ok(())
}

/// Merge command-line arguments over the configured defaults.
pub fn build_options(args: RunArgs, defaults: &DefaultsConfig) -> SbResult<SandboxOptions> {
    let mut options = SandboxOptions::new(args.program);
    options.args = args.args;
    options.update = args.update.or(defaults.update).unwrap_or_default();

    options.libraries = defaults
        .libraries
        .iter()
        .map(|raw| {
            raw.parse::<LibrarySpec>()
                .map_err(|e| SbError::InvalidOption(format!("defaults.libraries: {e}")))
        })
        .collect::<SbResult<_>>()?;
    options.libraries.extend(args.libraries);

    options.binaries = defaults.binaries.clone();
    options.binaries.extend(args.binaries);

    let share: BTreeSet<Namespace> = if args.share.is_empty() {
        defaults.share.iter().copied().collect()
    } else {
        args.share.into_iter().collect()
    };
    if !share.is_empty() {
        options.share = share;
    }

    options.sys_dirs = args.sys_dirs.into_iter().collect();
    options.app_dirs = args.app_dirs.into_iter().collect();
    options.devices = args.devices;
    options.features = Features {
        gui: args.gui,
        gtk: args.gtk,
        qt: args.qt,
        vulkan: args.vulkan,
        pipewire: args.pipewire,
        electron: args.electron,
        python: args.python,
        locale: args.locale,
        include: args.include,
        shell: args.shell,
        xdg_open: args.xdg_open,
        hardened_malloc: args.hardened_malloc,
    };
    options.dry = args.dry;
    options.hostname = args.hostname;
    options.env = args.env;

    options.app_id()?;
    Ok(options)
}
