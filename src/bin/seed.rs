use anyhow::Context;
use chrono::NaiveDate;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use eduportal_backend::config::Config;
use eduportal_backend::data::user::db::UserDbExt;
use eduportal_backend::data::user::{PasswordHash, Profile, StudentProfile, User};
use eduportal_backend::db;
use eduportal_backend::util;

const DEMO_PASSWORD: &str = "Student@123";

struct DemoStudent {
    first_name: &'static str,
    last_name: &'static str,
    email: &'static str,
    phone_number: &'static str,
    grade: u8,
    born: (i32, u32, u32),
}

const STUDENTS: [DemoStudent; 3] = [
    DemoStudent {
        first_name: "Emma",
        last_name: "Johnson",
        email: "emma.johnson@school.edu",
        phone_number: "5550102030",
        grade: 10,
        born: (2007, 5, 15),
    },
    DemoStudent {
        first_name: "Liam",
        last_name: "Chen",
        email: "liam.chen@school.edu",
        phone_number: "5550203040",
        grade: 11,
        born: (2006, 8, 22),
    },
    DemoStudent {
        first_name: "Sophia",
        last_name: "Rodriguez",
        email: "sophia.rodriguez@school.edu",
        phone_number: "5550304050",
        grade: 9,
        born: (2008, 2, 10),
    },
];

fn demo_user(student: &DemoStudent) -> anyhow::Result<User> {
    let (year, month, day) = student.born;
    let mut user = User::new(
        student.email,
        student.first_name,
        student.last_name,
        student.phone_number,
        PasswordHash::new(DEMO_PASSWORD)?,
        Profile::Student(StudentProfile {
            student_id: util::short_identifier("STU"),
            grade: student.grade,
            date_of_birth: NaiveDate::from_ymd_opt(year, month, day),
            parents: vec![],
        }),
    );
    user.is_verified = true;
    Ok(user)
}

/// Inserts demo students unless the first one already exists.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if dotenv::dotenv().is_err() {
        tracing::warn!("Unable to load .env file.");
    }
    let config = Config::load().unwrap_or_default();
    let db = db::connect_with_retry(&config)
        .await
        .context("seeding needs a reachable database")?;

    if db.find_user_by_email(STUDENTS[0].email).await?.is_some() {
        tracing::info!("Demo students are already present.");
        return Ok(());
    }

    for student in &STUDENTS {
        db.create_user(&demo_user(student)?).await?;
    }
    tracing::info!("Seeded {} demo students.", STUDENTS.len());
    Ok(())
}
