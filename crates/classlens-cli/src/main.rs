use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::path::{Path, PathBuf};

// D-Bus proxy for the classlensd daemon. `#[zbus::proxy]` also generates a
// blocking variant; only the async one is used here.
#[zbus::proxy(
    interface = "org.classlens.Attendance1",
    default_service = "org.classlens.Attendance1",
    default_path = "/org/classlens/Attendance1"
)]
trait Attendance {
    async fn register_student(
        &self,
        name: &str,
        email: &str,
        phone_number: &str,
        department: &str,
        image: Vec<u8>,
    ) -> zbus::Result<String>;

    async fn mark_attendance(&self, class_id: i64, image: Vec<u8>) -> zbus::Result<String>;

    async fn list_students(&self) -> zbus::Result<String>;

    async fn get_student(&self, student_id: i64) -> zbus::Result<String>;

    async fn list_attendance(&self, limit: u32) -> zbus::Result<String>;

    async fn create_faculty(
        &self,
        name: &str,
        email: &str,
        phone_number: &str,
        role: &str,
    ) -> zbus::Result<String>;

    async fn list_faculties(&self) -> zbus::Result<String>;

    async fn create_class(
        &self,
        class_name: &str,
        faculty_id: i64,
        schedule_start: &str,
        schedule_end: &str,
    ) -> zbus::Result<String>;

    async fn list_classes(&self) -> zbus::Result<String>;

    async fn generate_reports(&self) -> zbus::Result<String>;

    async fn list_reports(&self) -> zbus::Result<String>;

    async fn export_reports_csv(&self) -> zbus::Result<String>;

    async fn status(&self) -> zbus::Result<String>;

    #[zbus(signal)]
    fn attendance_marked(&self, payload: String) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "classlens", about = "ClassLens attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a student from a face photo
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long, default_value = "")]
        phone: String,
        #[arg(long, default_value = "")]
        department: String,
        /// Path to the face photo
        image: PathBuf,
    },
    /// Mark attendance from a face photo
    Mark {
        /// Class context for the mark
        #[arg(long)]
        class_id: Option<i64>,
        /// Path to the face photo
        image: PathBuf,
    },
    /// List enrolled students
    Students,
    /// Show one student profile
    Student {
        /// Student ID
        id: i64,
    },
    /// List recent attendance records
    Attendance {
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Manage faculty members
    Faculty {
        #[command(subcommand)]
        command: FacultyCommands,
    },
    /// Manage classes
    Class {
        #[command(subcommand)]
        command: ClassCommands,
    },
    /// Generate, list and export attendance reports
    Report {
        #[command(subcommand)]
        command: ReportCommands,
    },
    /// Stream attendance events as they happen
    Watch,
    /// Show daemon status
    Status,
}

#[derive(Subcommand)]
enum FacultyCommands {
    /// Add a faculty member
    Add {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        email: String,
        #[arg(long, default_value = "")]
        phone: String,
        #[arg(long, default_value = "")]
        role: String,
    },
    /// List faculty members
    List,
}

#[derive(Subcommand)]
enum ClassCommands {
    /// Add a class
    Add {
        #[arg(long)]
        name: String,
        /// Owning faculty member
        #[arg(long)]
        faculty_id: Option<i64>,
        /// Schedule start, HH:MM:SS
        #[arg(long, default_value = "")]
        start: String,
        /// Schedule end, HH:MM:SS
        #[arg(long, default_value = "")]
        end: String,
    },
    /// List classes
    List,
}

#[derive(Subcommand)]
enum ReportCommands {
    /// Generate a fresh batch of reports
    Generate,
    /// List generated reports
    List,
    /// Export all reports as CSV
    Export {
        /// Write to a file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = zbus::Connection::system()
        .await
        .context("connecting to the system bus (is classlensd running?)")?;
    let proxy = AttendanceProxy::new(&conn).await?;

    match cli.command {
        Commands::Register { name, email, phone, department, image } => {
            let bytes = read_image(&image)?;
            let student = proxy
                .register_student(&name, &email, &phone, &department, bytes)
                .await?;
            println!("{}", pretty(&student));
        }
        Commands::Mark { class_id, image } => {
            let bytes = read_image(&image)?;
            let response = proxy.mark_attendance(class_id.unwrap_or(0), bytes).await?;
            let value: serde_json::Value = serde_json::from_str(&response)?;
            if value["matched"].as_bool().unwrap_or(false) {
                println!(
                    "Matched: student {} (distance {:.4})",
                    value["attendance"]["student_id"],
                    value["distance"].as_f64().unwrap_or(f64::NAN)
                );
                println!("{}", pretty(&value["attendance"].to_string()));
            } else {
                println!("Match Not Found");
            }
        }
        Commands::Students => println!("{}", pretty(&proxy.list_students().await?)),
        Commands::Student { id } => println!("{}", pretty(&proxy.get_student(id).await?)),
        Commands::Attendance { limit } => {
            println!("{}", pretty(&proxy.list_attendance(limit).await?))
        }
        Commands::Faculty { command } => match command {
            FacultyCommands::Add { name, email, phone, role } => {
                let faculty = proxy.create_faculty(&name, &email, &phone, &role).await?;
                println!("{}", pretty(&faculty));
            }
            FacultyCommands::List => println!("{}", pretty(&proxy.list_faculties().await?)),
        },
        Commands::Class { command } => match command {
            ClassCommands::Add { name, faculty_id, start, end } => {
                let class = proxy
                    .create_class(&name, faculty_id.unwrap_or(0), &start, &end)
                    .await?;
                println!("{}", pretty(&class));
            }
            ClassCommands::List => println!("{}", pretty(&proxy.list_classes().await?)),
        },
        Commands::Report { command } => match command {
            ReportCommands::Generate => {
                println!("{}", pretty(&proxy.generate_reports().await?))
            }
            ReportCommands::List => println!("{}", pretty(&proxy.list_reports().await?)),
            ReportCommands::Export { out } => {
                let csv = proxy.export_reports_csv().await?;
                match out {
                    Some(path) => {
                        std::fs::write(&path, &csv)
                            .with_context(|| format!("writing {}", path.display()))?;
                        let count = csv.lines().count().saturating_sub(1);
                        println!("Exported {} to {}", plural(count, "report"), path.display());
                    }
                    None => print!("{csv}"),
                }
            }
        },
        Commands::Watch => {
            println!("Watching attendance feed (Ctrl-C to stop)");
            let mut stream = proxy.receive_attendance_marked().await?;
            while let Some(signal) = stream.next().await {
                let args = signal.args()?;
                println!("{}", args.payload());
            }
        }
        Commands::Status => println!("{}", pretty(&proxy.status().await?)),
    }

    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// Pretty-print a JSON response; fall back to the raw text when it is not
/// valid JSON.
fn pretty(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| raw.to_string())
}

fn plural(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("1 {noun}")
    } else {
        format!("{count} {noun}s")
    }
}
