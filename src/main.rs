use clap::{Args, Parser, Subcommand, ValueEnum};
use csv::{Writer, WriterBuilder};
use ndarray::Array1;
use std::fs::File;
use std::path::{Path, PathBuf};
use xpspec::{
    AbsoluteRequest, BasisCoefficientRecord, BatchRequest, CovarianceConvention, InstrumentModel,
    LineKind, MergePolicy, SamplingOptions, SourceOutcome, SourceRecords, SpectrumEngine,
};

#[derive(Parser, Debug)]
#[command(name = "xpspec")]
#[command(about = "Sample and analyse basis-coefficient spectra", long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Per-band internal spectra on a pseudo-wavelength grid.
    Internal(InternalArgs),
    /// Merged absolute spectra on a wavelength grid.
    #[command(alias = "absolute")]
    Calibrate(CalibrateArgs),
    /// Extrema, inflection points and line records.
    Extrema(ExtremaArgs),
}

#[derive(Args, Debug)]
struct InputArgs {
    /// Instrument model (JSON).
    model: PathBuf,
    /// Basis coefficient records (JSON array).
    records: PathBuf,
    #[arg(long = "out")]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SamplingArgs {
    /// Zero coefficients beyond each record's relevant bases.
    #[arg(long = "truncate", default_value_t = false)]
    truncate: bool,
    #[arg(long = "convention", value_enum, default_value_t = ConventionArg::Sigma2)]
    convention: ConventionArg,
    /// Required by `--convention dof`.
    #[arg(long = "degrees-of-freedom")]
    degrees_of_freedom: Option<u32>,
}

#[derive(Args, Debug)]
struct GridArgs {
    #[arg(long = "start")]
    start: f64,
    #[arg(long = "stop")]
    stop: f64,
    #[arg(long = "points", default_value_t = 60)]
    points: usize,
}

#[derive(Args, Debug)]
struct InternalArgs {
    #[command(flatten)]
    input: InputArgs,
    #[command(flatten)]
    sampling: SamplingArgs,
    #[command(flatten)]
    grid: GridArgs,
}

#[derive(Args, Debug)]
struct CalibrateArgs {
    #[command(flatten)]
    input: InputArgs,
    #[command(flatten)]
    sampling: SamplingArgs,
    #[command(flatten)]
    grid: GridArgs,
    /// Treatment of sources with a single band.
    #[arg(long = "policy", value_enum)]
    policy: PolicyArg,
}

#[derive(Args, Debug)]
struct ExtremaArgs {
    #[command(flatten)]
    input: InputArgs,
    #[arg(long = "truncate", default_value_t = false)]
    truncate: bool,
    /// Write line records instead of raw roots.
    #[arg(long = "lines", default_value_t = false)]
    lines: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ConventionArg {
    Unscaled,
    Sigma2,
    Dof,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PolicyArg {
    Masked,
    Missing,
}

impl From<PolicyArg> for MergePolicy {
    fn from(value: PolicyArg) -> Self {
        match value {
            PolicyArg::Masked => MergePolicy::MaskedCoverage,
            PolicyArg::Missing => MergePolicy::FullyMissing,
        }
    }
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let cli = Cli::parse();
    match cli.command {
        Command::Internal(args) => run_internal(args),
        Command::Calibrate(args) => run_calibrate(args),
        Command::Extrema(args) => run_extrema(args),
    }
}

fn run_internal(args: InternalArgs) -> Result<(), String> {
    let (engine, sources) = load_inputs(&args.input)?;
    let request = BatchRequest {
        options: sampling_options(&args.sampling)?,
        pseudo_grid: Some(grid(&args.grid)?),
        ..BatchRequest::default()
    };
    let outcomes = engine.process_batch(&sources, &request);
    let mut wtr = open_writer(args.input.out.as_deref())?;
    write_row(&mut wtr, &["source_id", "band", "pseudo_wavelength", "flux", "error"])?;
    for products in succeeded(&outcomes) {
        for (band, spectrum) in products.internal.iter() {
            let Some(spectrum) = spectrum else { continue };
            for j in 0..spectrum.len() {
                write_row(
                    &mut wtr,
                    &[
                        products.source_id.to_string(),
                        band.tag().to_string(),
                        format!("{:.6}", spectrum.positions[j]),
                        format!("{:.12e}", spectrum.flux[j]),
                        format!("{:.12e}", spectrum.error[j]),
                    ],
                )?;
            }
        }
    }
    finish(wtr, &outcomes)
}

fn run_calibrate(args: CalibrateArgs) -> Result<(), String> {
    let (engine, sources) = load_inputs(&args.input)?;
    let request = BatchRequest {
        options: sampling_options(&args.sampling)?,
        absolute: Some(AbsoluteRequest {
            wavelengths: grid(&args.grid)?,
            policy: args.policy.into(),
        }),
        ..BatchRequest::default()
    };
    let outcomes = engine.process_batch(&sources, &request);
    let mut wtr = open_writer(args.input.out.as_deref())?;
    write_row(&mut wtr, &["source_id", "wavelength", "flux", "error", "missing"])?;
    for products in succeeded(&outcomes) {
        let Some(spectrum) = &products.absolute else {
            continue;
        };
        for j in 0..spectrum.len() {
            write_row(
                &mut wtr,
                &[
                    products.source_id.to_string(),
                    format!("{:.6}", spectrum.positions[j]),
                    format!("{:.12e}", spectrum.flux[j]),
                    format!("{:.12e}", spectrum.error[j]),
                    spectrum.missing[j].to_string(),
                ],
            )?;
        }
    }
    finish(wtr, &outcomes)
}

fn run_extrema(args: ExtremaArgs) -> Result<(), String> {
    let (engine, sources) = load_inputs(&args.input)?;
    let request = BatchRequest {
        options: SamplingOptions {
            truncation: args.truncate,
            ..SamplingOptions::default()
        },
        extrema: !args.lines,
        lines: args.lines,
        ..BatchRequest::default()
    };
    let outcomes = engine.process_batch(&sources, &request);
    let mut wtr = open_writer(args.input.out.as_deref())?;
    if args.lines {
        write_row(
            &mut wtr,
            &["source_id", "band", "kind", "pseudo_wavelength", "wavelength", "flux", "width"],
        )?;
        for products in succeeded(&outcomes) {
            for line in &products.lines {
                let kind = match line.kind {
                    LineKind::Emission => "emission",
                    LineKind::Absorption => "absorption",
                };
                write_row(
                    &mut wtr,
                    &[
                        line.source_id.to_string(),
                        line.band.tag().to_string(),
                        kind.to_string(),
                        format!("{:.6}", line.pseudo_wavelength),
                        format!("{:.6}", line.wavelength),
                        format!("{:.12e}", line.flux),
                        line.width_wavelength
                            .map(|w| format!("{w:.6}"))
                            .unwrap_or_default(),
                    ],
                )?;
            }
        }
    } else {
        write_row(
            &mut wtr,
            &["source_id", "band", "order", "status", "pseudo_wavelength", "wavelength"],
        )?;
        for products in succeeded(&outcomes) {
            for (band, set) in products.extrema.iter() {
                let Some(set) = set else { continue };
                let orders = [
                    (1, &set.first, &set.first_wavelength),
                    (2, &set.second, &set.second_wavelength),
                ];
                for (order, roots, wavelengths) in orders {
                    let status = format!("{:?}", roots.status);
                    if roots.is_empty() {
                        write_row(
                            &mut wtr,
                            &[
                                products.source_id.to_string(),
                                band.tag().to_string(),
                                order.to_string(),
                                status.clone(),
                                String::new(),
                                String::new(),
                            ],
                        )?;
                    }
                    for (root, wavelength) in roots.roots.iter().zip(wavelengths.iter()) {
                        write_row(
                            &mut wtr,
                            &[
                                products.source_id.to_string(),
                                band.tag().to_string(),
                                order.to_string(),
                                status.clone(),
                                format!("{root:.6}"),
                                format!("{wavelength:.6}"),
                            ],
                        )?;
                    }
                }
            }
        }
    }
    finish(wtr, &outcomes)
}

fn load_inputs(input: &InputArgs) -> Result<(SpectrumEngine, Vec<SourceRecords>), String> {
    let model = InstrumentModel::from_path(&input.model).map_err(|e| e.to_string())?;
    let engine = SpectrumEngine::new(model).map_err(|e| e.to_string())?;
    let payload = std::fs::read_to_string(&input.records).map_err(|e| {
        format!(
            "failed to read records '{}': {e}",
            input.records.display()
        )
    })?;
    let records: Vec<BasisCoefficientRecord> = serde_json::from_str(&payload)
        .map_err(|e| format!("failed to parse records '{}': {e}", input.records.display()))?;
    let sources = SourceRecords::group(records);
    log::info!(
        "loaded {} sources from '{}'",
        sources.len(),
        input.records.display()
    );
    Ok((engine, sources))
}

fn sampling_options(args: &SamplingArgs) -> Result<SamplingOptions, String> {
    let covariance_convention = match args.convention {
        ConventionArg::Unscaled => CovarianceConvention::Unscaled,
        ConventionArg::Sigma2 => CovarianceConvention::StandardDeviationSquared,
        ConventionArg::Dof => CovarianceConvention::DegreesOfFreedomCorrected {
            degrees_of_freedom: args
                .degrees_of_freedom
                .ok_or_else(|| "--convention dof requires --degrees-of-freedom".to_string())?,
        },
    };
    Ok(SamplingOptions {
        truncation: args.truncate,
        with_covariance: false,
        covariance_convention,
    })
}

fn grid(args: &GridArgs) -> Result<Vec<f64>, String> {
    if args.points < 2 || !(args.start < args.stop) {
        return Err(format!(
            "grid needs at least two points and start < stop (got {} points over [{}, {}])",
            args.points, args.start, args.stop
        ));
    }
    Ok(Array1::linspace(args.start, args.stop, args.points).to_vec())
}

fn open_writer(out: Option<&Path>) -> Result<Writer<Box<dyn std::io::Write>>, String> {
    let sink: Box<dyn std::io::Write> = match out {
        Some(path) => Box::new(File::create(path).map_err(|e| {
            format!("failed to create output csv '{}': {e}", path.display())
        })?),
        None => Box::new(std::io::stdout()),
    };
    Ok(WriterBuilder::new().has_headers(true).from_writer(sink))
}

fn write_row<I, T>(wtr: &mut Writer<Box<dyn std::io::Write>>, row: I) -> Result<(), String>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    wtr.write_record(row)
        .map_err(|e| format!("failed writing csv row: {e}"))
}

fn succeeded(outcomes: &[SourceOutcome]) -> impl Iterator<Item = &xpspec::SourceProducts> {
    outcomes.iter().filter_map(|o| o.result.as_ref().ok())
}

fn finish(mut wtr: Writer<Box<dyn std::io::Write>>, outcomes: &[SourceOutcome]) -> Result<(), String> {
    wtr.flush()
        .map_err(|e| format!("failed to flush csv output: {e}"))?;
    let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
    if failed > 0 {
        eprintln!("{failed} of {} sources failed; see log for details", outcomes.len());
    }
    Ok(())
}
