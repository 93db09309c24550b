use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use env_logger::Builder;
use log::{error, info};

use fwupdate_lib::config::{UpdateMode, UpdaterConfig};
use fwupdate_lib::error::UpdateError;
use fwupdate_lib::image::Image;
use fwupdate_lib::manifest;
use fwupdate_lib::policy;
use fwupdate_lib::programmer;
use fwupdate_lib::quirks::Quirks;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Autoupdate,
    Recovery,
    Legacy,
    Factory,
    FactoryInstall,
}

/// Update an AP (application processor) boot firmware image.
#[derive(Parser)]
#[command(arg_required_else_help = true, version)]
struct Cli {
    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity,

    /// Target image path, or `-` to read from standard input.
    #[arg(short = 'i', long = "image")]
    image: Option<String>,

    /// EC image to write alongside a full update.
    #[arg(short = 'e', long = "ec_image")]
    ec_image: Option<PathBuf>,

    /// PD image to write alongside a full update.
    #[arg(short = 'P', long = "pd_image")]
    pd_image: Option<PathBuf>,

    /// Archive root (directory) to resolve relative image paths against.
    #[arg(short = 'a', long = "archive")]
    archive: Option<PathBuf>,

    /// Comma/space separated quirks list: `name` or `name=INT`.
    #[arg(long)]
    quirks: Option<String>,

    #[arg(long = "mode", value_enum)]
    mode: Option<ModeArg>,

    /// Shorthand for `--mode=autoupdate`.
    #[arg(short = 't')]
    autoupdate: bool,

    /// Shorthand for `--mode=factory`.
    #[arg(long)]
    factory: bool,

    /// Programmer identifier passed to the flash backend.
    #[arg(long)]
    programmer: Option<String>,

    /// Emulate writes against a local file instead of real flash.
    #[arg(long)]
    emulate: Option<PathBuf>,

    /// Override system properties: comma/space separated integers in
    /// `mainfw_act,tpm_fwver,fw_vboot2,platform_ver,wp_hw,wp_sw` order.
    #[arg(long = "sys_props")]
    sys_props: Option<String>,

    /// Force both wp_hw and wp_sw to this value.
    #[arg(long)]
    wp: Option<u8>,

    /// Waive the TPM anti-rollback check.
    #[arg(long)]
    force: bool,

    /// Print a JSON description of the archive's model configurations
    /// and images, then exit. Requires `-a`.
    #[arg(long)]
    manifest: bool,
}

fn main() -> ExitCode {
    Builder::from_default_env()
        .format_target(false)
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();

    if cli.manifest {
        return run_manifest(&cli);
    }

    let mut cfg = match build_config(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{e}");
            return exit_for(&Err(UpdateError::InvalidImage(e)));
        }
    };

    let result = policy::update(&mut cfg);
    match &result {
        Ok(()) => info!("update complete"),
        Err(e) => error!("update failed: {e}"),
    }
    exit_for(&result)
}

fn run_manifest(cli: &Cli) -> ExitCode {
    let Some(archive) = &cli.archive else {
        error!("--manifest requires -a");
        return ExitCode::from(2);
    };
    match manifest::discover(archive) {
        Ok(models) => match manifest::render_json(&models) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("failed to render manifest: {e}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            error!("failed to read archive root {archive:?}: {e}");
            ExitCode::FAILURE
        }
    }
}

fn build_config(cli: &Cli) -> Result<UpdaterConfig, String> {
    let mut cfg = UpdaterConfig::new();
    cfg.verbosity = cli.verbosity.log_level_filter() as u8;
    cfg.force_update = cli.force;
    cfg.try_update = cli.autoupdate || matches!(cli.mode, Some(ModeArg::Autoupdate) | None);

    cfg.mode = match (&cli.mode, cli.factory) {
        (_, true) => UpdateMode::Factory,
        (Some(ModeArg::Factory), _) => UpdateMode::Factory,
        (Some(ModeArg::FactoryInstall), _) => UpdateMode::FactoryInstall,
        (Some(ModeArg::Legacy), _) => UpdateMode::Legacy,
        (Some(ModeArg::Recovery), _) => UpdateMode::Recovery,
        (Some(ModeArg::Autoupdate), _) | (None, _) => UpdateMode::AutoUpdate,
    };

    if let Some(path) = &cli.emulate {
        cfg.emulation_path = Some(path.clone());
    }
    if let Some(spec) = &cli.programmer {
        cfg.programmer_spec = Some(spec.clone());
    }

    if let Some(image_arg) = &cli.image {
        let target = load_image_arg(image_arg, cli.archive.as_deref(), "target", &mut cfg)?;
        cfg.quirks = Quirks::defaults_for_target(&target.ro_version);
        cfg.target = Some(target);
    }
    if let Some(list) = &cli.quirks {
        cfg.quirks.apply_list(list).map_err(|e| format!("--quirks: {e}"))?;
    }

    if let Some(path) = &cli.ec_image {
        cfg.ec_image = Some(Image::load_from_file(path, "ec").map_err(|e| format!("EC image {path:?}: {e}"))?);
    }
    if let Some(path) = &cli.pd_image {
        cfg.pd_image = Some(Image::load_from_file(path, "pd").map_err(|e| format!("PD image {path:?}: {e}"))?);
    }

    if let Some(list) = &cli.sys_props {
        cfg.sys_props.apply_overrides(list).map_err(|e| format!("--sys_props: {e}"))?;
    }
    if let Some(wp) = cli.wp {
        cfg.sys_props.force_wp(wp != 0);
    }

    Ok(cfg)
}

fn load_image_arg(
    arg: &str,
    archive: Option<&Path>,
    programmer_name: &str,
    cfg: &mut UpdaterConfig,
) -> Result<Image, String> {
    if arg == "-" {
        let path = programmer::drain_stdin_to_tempfile().map_err(|e| format!("reading stdin: {e}"))?;
        cfg.register_temp_file(path.clone());
        return Image::load_from_file(&path, programmer_name).map_err(|e| format!("stdin image: {e}"));
    }
    let path = manifest::resolve_image_path(archive, arg);
    Image::load_from_file(&path, programmer_name).map_err(|e| format!("{path:?}: {e}"))
}

/// Map the closed error taxonomy (spec.md §7) to a process exit code.
/// `0` is `Done`; every other variant gets a distinct non-zero code so
/// callers can distinguish failure classes without parsing the message.
fn exit_for(result: &Result<(), UpdateError>) -> ExitCode {
    let code: u8 = match result {
        Ok(()) => 0,
        Err(UpdateError::NoImage) => 2,
        Err(UpdateError::SystemImage(_)) => 3,
        Err(UpdateError::InvalidImage(_)) => 4,
        Err(UpdateError::SetCookies(_)) => 5,
        Err(UpdateError::WriteFirmware(_)) => 6,
        Err(UpdateError::Platform(_)) => 7,
        Err(UpdateError::Target(_)) => 8,
        Err(UpdateError::RootKey(_)) => 9,
        Err(UpdateError::TpmRollback(_)) => 10,
        Err(UpdateError::NeedRoUpdate) => 11, // never escapes policy::update
        Err(UpdateError::Unknown(_)) => 1,
    };
    ExitCode::from(code)
}
