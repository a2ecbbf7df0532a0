use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{Attributes, Decision, EnrollRequest};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod serve;
#[cfg(test)]
mod testutil;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face enrollment and recognition")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a student or update their record
    Enroll {
        /// Unique student code
        #[arg(short, long)]
        code: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        course: Option<String>,
        #[arg(long)]
        branch: Option<String>,
        /// Reference photo; omit to update attributes only
        #[arg(short, long)]
        image: Option<PathBuf>,
    },
    /// Identify the student in a photo
    Recognize {
        image: PathBuf,
    },
    /// Show the face regions found in a photo
    Detect {
        image: PathBuf,
    },
    /// Show one enrolled student
    Show {
        code: String,
        /// Write the stored reference photo to this path
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// List enrolled students
    List,
    /// Remove an enrolled student
    Remove {
        code: String,
    },
    /// Show configuration and registry status
    Status,
    /// Serve JSON-lines requests on stdin/stdout
    Serve,
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config::Config::from_env();
    let engine = engine::spawn_engine(&config).with_context(|| {
        format!(
            "starting engine (cascade {}, registry {})",
            config.cascade_path.display(),
            config.db_path.display()
        )
    })?;

    match cli.command {
        Commands::Enroll { code, name, course, branch, image } => {
            let image = image.as_deref().map(read_image).transpose()?;
            let outcome = engine
                .enroll(EnrollRequest {
                    code,
                    attributes: Attributes { display_name: name, course, branch },
                    image,
                })
                .await?;
            println!("{} {} (record {})", outcome.message(), outcome.code, outcome.record_id);
            match (outcome.vectorized, outcome.face) {
                (true, Some(face)) => println!(
                    "  face at {},{} size {}x{}",
                    face.x, face.y, face.width, face.height
                ),
                (true, None) => println!("  no face found; whole photo encoded"),
                (false, _) => println!("  attributes only; stored photo unchanged"),
            }
        }
        Commands::Recognize { image } => {
            let recognition = engine.recognize(read_image(&image)?).await?;
            match recognition.decision {
                Decision::Match { code, attributes, distance } => {
                    let name = attributes.display_name.unwrap_or_default();
                    println!("match: {code} {name} (distance {distance:.4})");
                }
                Decision::NoMatch { best_distance } => {
                    println!(
                        "no match among {} students (best distance {best_distance:.4}, threshold {:.4})",
                        recognition.compared, config.distance_threshold
                    );
                }
            }
        }
        Commands::Detect { image } => {
            let report = engine.detect(read_image(&image)?).await?;
            println!("{}x{}: {} face(s)", report.width, report.height, report.faces.len());
            for face in &report.faces {
                let marker = if Some(*face) == report.primary { "*" } else { " " };
                println!(
                    "{marker} {},{} size {}x{}",
                    face.x, face.y, face.width, face.height
                );
            }
        }
        Commands::Show { code, export } => {
            let Some(record) = engine.show(code.clone()).await? else {
                bail!("no student with code {code}");
            };
            println!("{} (record {})", record.code, record.record_id);
            println!("  name:    {}", record.attributes.display_name.as_deref().unwrap_or("-"));
            println!("  course:  {}", record.attributes.course.as_deref().unwrap_or("-"));
            println!("  branch:  {}", record.attributes.branch.as_deref().unwrap_or("-"));
            println!("  vector:  {}", if record.feature_vector.is_some() { "yes" } else { "no" });
            println!("  created: {}", record.created_at);
            println!("  updated: {}", record.updated_at);
            if let Some(path) = export {
                let Some(png) = record.enrolled_image else {
                    bail!("{code} has no stored photo");
                };
                std::fs::write(&path, png).with_context(|| format!("writing {}", path.display()))?;
                println!("  photo exported to {}", path.display());
            }
        }
        Commands::List => {
            let records = engine.list().await?;
            if records.is_empty() {
                println!("No students enrolled");
            }
            for r in records {
                println!(
                    "{:<12} {:<24} {:<10} {:<10} {}",
                    r.code,
                    r.attributes.display_name.as_deref().unwrap_or("-"),
                    r.attributes.course.as_deref().unwrap_or("-"),
                    r.attributes.branch.as_deref().unwrap_or("-"),
                    if r.has_vector { "enrolled" } else { "no photo" }
                );
            }
        }
        Commands::Remove { code } => {
            if engine.remove(code.clone()).await? == 0 {
                bail!("no student with code {code}");
            }
            println!("removed {code}");
        }
        Commands::Status => {
            let records = engine.list().await?;
            let vectorised = records.iter().filter(|r| r.has_vector).count();
            println!("{}", serde_json::to_string_pretty(&config)?);
            println!(
                "registry: {} students, {vectorised} with photos; {} workers",
                records.len(),
                engine.worker_count()
            );
        }
        Commands::Serve => {
            tracing::info!(workers = engine.worker_count(), "serving JSON lines on stdin");
            serve::run(engine).await?;
        }
    }

    Ok(())
}
