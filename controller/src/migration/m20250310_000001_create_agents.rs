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
                    .table(Agents::Table)
                    .if_not_exists()
                    .col(string(Agents::Id).primary_key())
                    .col(string(Agents::Hostname))
                    .col(string(Agents::IpAddress))
                    .col(integer(Agents::RpcPort).default(9091))
                    .col(string(Agents::IpRange).default(""))
                    .col(string(Agents::Country).default(""))
                    .col(string(Agents::Region).default(""))
                    .col(string(Agents::City).default(""))
                    .col(string(Agents::Isp).default(""))
                    .col(string(Agents::Version).default(""))
                    .col(string(Agents::Status).default("offline"))
                    .col(string(Agents::Token).default(""))
                    .col(timestamp_null(Agents::LastHeartbeat))
                    .col(integer(Agents::CurrentConnections).default(0))
                    .col(double(Agents::CpuUsage).default(0.0))
                    .col(double(Agents::MemoryUsage).default(0.0))
                    .col(double(Agents::DiskUsage).default(0.0))
                    .col(integer(Agents::NetworkLatency).default(0))
                    .col(json_null(Agents::Metadata))
                    .col(timestamp(Agents::CreatedAt))
                    .col(timestamp(Agents::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_agents_status")
                    .table(Agents::Table)
                    .col(Agents::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_agents_ip_address")
                    .table(Agents::Table)
                    .col(Agents::IpAddress)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_agents_last_heartbeat")
                    .table(Agents::Table)
                    .col(Agents::LastHeartbeat)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Agents::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Agents {
    Table,
    Id,
    Hostname,
    IpAddress,
    RpcPort,
    IpRange,
    Country,
    Region,
    City,
    Isp,
    Version,
    Status,
    Token,
    LastHeartbeat,
    CurrentConnections,
    CpuUsage,
    MemoryUsage,
    DiskUsage,
    NetworkLatency,
    Metadata,
    CreatedAt,
    UpdatedAt,
}
