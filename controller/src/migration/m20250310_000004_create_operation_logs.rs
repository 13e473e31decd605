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
                    .table(OperationLogs::Table)
                    .if_not_exists()
                    .col(integer(OperationLogs::Id).auto_increment().primary_key())
                    .col(string_null(OperationLogs::AgentId))
                    .col(string(OperationLogs::OperationType))
                    .col(json_null(OperationLogs::OperationContent))
                    .col(string(OperationLogs::Result))
                    .col(text_null(OperationLogs::ErrorMessage))
                    .col(string(OperationLogs::Operator).default(""))
                    .col(timestamp(OperationLogs::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_operation_logs_agent")
                    .table(OperationLogs::Table)
                    .col(OperationLogs::AgentId)
                    .col(OperationLogs::OperationType)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(OperationLogs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum OperationLogs {
    Table,
    Id,
    AgentId,
    OperationType,
    OperationContent,
    Result,
    ErrorMessage,
    Operator,
    CreatedAt,
}
