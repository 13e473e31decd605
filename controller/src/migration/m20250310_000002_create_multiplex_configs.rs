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
                    .table(MultiplexConfigs::Table)
                    .if_not_exists()
                    .col(integer(MultiplexConfigs::Id).auto_increment().primary_key())
                    .col(string(MultiplexConfigs::AgentId))
                    .col(string(MultiplexConfigs::Protocol))
                    .col(boolean(MultiplexConfigs::Enabled).default(false))
                    .col(string(MultiplexConfigs::MultiplexProtocol).default("smux"))
                    .col(integer(MultiplexConfigs::MaxConnections).default(4))
                    .col(integer(MultiplexConfigs::MinStreams).default(4))
                    .col(boolean(MultiplexConfigs::Padding).default(false))
                    .col(json_null(MultiplexConfigs::BrutalConfig))
                    .col(string(MultiplexConfigs::Status).default("inactive"))
                    .col(text_null(MultiplexConfigs::ErrorMessage))
                    .col(string(MultiplexConfigs::ConfigVersion).default(""))
                    .col(timestamp(MultiplexConfigs::CreatedAt))
                    .col(timestamp(MultiplexConfigs::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        // (agent_id, protocol) 唯一
        manager
            .create_index(
                Index::create()
                    .name("idx_multiplex_agent_protocol")
                    .table(MultiplexConfigs::Table)
                    .col(MultiplexConfigs::AgentId)
                    .col(MultiplexConfigs::Protocol)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(MultiplexConfigs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum MultiplexConfigs {
    Table,
    Id,
    AgentId,
    Protocol,
    Enabled,
    MultiplexProtocol,
    MaxConnections,
    MinStreams,
    Padding,
    BrutalConfig,
    Status,
    ErrorMessage,
    ConfigVersion,
    CreatedAt,
    UpdatedAt,
}
