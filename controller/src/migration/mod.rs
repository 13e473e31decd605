use sea_orm::{Database, DatabaseConnection};
use sea_orm_migration::prelude::*;
use std::fs::create_dir_all;
use std::path::Path;
use tokio::sync::OnceCell;

mod m20250310_000001_create_agents;
mod m20250310_000002_create_multiplex_configs;
mod m20250310_000003_create_configs;
mod m20250310_000004_create_operation_logs;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250310_000001_create_agents::Migration),
            Box::new(m20250310_000002_create_multiplex_configs::Migration),
            Box::new(m20250310_000003_create_configs::Migration),
            Box::new(m20250310_000004_create_operation_logs::Migration),
        ]
    }
}

static DATABASE_CONNECTION: OnceCell<DatabaseConnection> = OnceCell::const_new();
static DATABASE_URL: OnceCell<String> = OnceCell::const_new();

/// 记录数据库 URL，必须在首次 get_connection 之前调用
pub fn set_database_url(url: String) {
    let _ = DATABASE_URL.set(url);
}

pub async fn get_connection() -> &'static DatabaseConnection {
    DATABASE_CONNECTION.get_or_init(init_database).await
}

async fn init_database() -> DatabaseConnection {
    let url = DATABASE_URL
        .get()
        .cloned()
        .unwrap_or_else(|| "sqlite://data/xbox.db?mode=rwc".to_string());

    // sqlite 需要保证目录存在
    if let Some(path) = url.strip_prefix("sqlite://") {
        let file = path.split('?').next().unwrap_or(path);
        if let Some(parent) = Path::new(file).parent() {
            if !parent.as_os_str().is_empty() {
                create_dir_all(parent).expect("无法创建数据库目录");
            }
        }
    }

    Database::connect(&url)
        .await
        .expect("failed to connect database")
}
