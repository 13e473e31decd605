use sea_orm_migration::prelude::*;
use sea_orm_migration::schema::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Configs::Table)
                    .if_not_exists()
                    .col(integer(Configs::Id).auto_increment().primary_key())
                    .col(string(Configs::AgentId))
                    .col(text(Configs::ConfigContent))
                    .col(string(Configs::ConfigVersion))
                    .col(string(Configs::Status).default("pending"))
                    .col(timestamp_null(Configs::ApplyTime))
                    .col(text_null(Configs::ErrorMessage))
                    .col(timestamp(Configs::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_configs_agent_version")
                    .table(Configs::Table)
                    .col(Configs::AgentId)
                    .col(Configs::ConfigVersion)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Configs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Configs {
    Table,
    Id,
    AgentId,
    ConfigContent,
    ConfigVersion,
    Status,
    ApplyTime,
    ErrorMessage,
    CreatedAt,
}
