//! 离线写入与重连重放示例
//!
//! 用内存远端模拟两台设备：一台离线修改，恢复网络后另一台收到变更。

use playa_sdk::remote::Collection;
use playa_sdk::utils::logging;
use playa_sdk::{BoardEvent, MemoryRemoteStore, PaymentMethod, PlayaBoard, PlayaConfig, RemoteStore};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init(true);
    println!("=== Playa SDK 离线重放示例 ===\n");

    let data_dir = std::env::temp_dir().join("playa_offline_replay");
    let remote = Arc::new(MemoryRemoteStore::new());

    let kiosk = PlayaBoard::initialize(
        PlayaConfig::builder()
            .data_dir(data_dir.join("kiosk"))
            .station_id("kiosk")
            .timezone_hours(2)
            .build(),
        remote.clone(),
    )
    .await?;
    let tablet = PlayaBoard::initialize(
        PlayaConfig::builder()
            .data_dir(data_dir.join("tablet"))
            .station_id("tablet")
            .timezone_hours(2)
            .build(),
        remote.clone(),
    )
    .await?;

    let mut tablet_events = tablet.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = tablet_events.recv().await {
            if let BoardEvent::ElementChanged { id, step, origin, .. } = event {
                println!("   平板收到: {} -> 步骤 {} ({:?})", id, step, origin);
            }
        }
    });

    tokio::time::sleep(Duration::from_millis(200)).await;

    println!("1️⃣ 收银台断网，修改三个元素");
    kiosk.set_network_online(false).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    kiosk.set_element_step("clon_1", 3).await?;
    kiosk.set_customer_name("clon_2", Some("Ana")).await?;
    kiosk.toggle_element("circle_0").await?;
    kiosk
        .record_payment("1", Decimal::new(15, 0), Decimal::new(20, 0), PaymentMethod::Cash)
        .await?;
    println!("   待同步: {}\n", kiosk.pending_count());

    println!("2️⃣ 恢复网络");
    kiosk.set_network_online(true).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    println!("   待同步: {}", kiosk.pending_count());
    println!(
        "   远端躺椅文档: {}",
        remote.list_documents(Collection::Seats, 10).await?.len()
    );
    println!("   平板合计: {:?}\n", tablet.totals().await);

    println!("3️⃣ 汇总导出");
    println!("{}", kiosk.export_summary_csv().await);
    for line in kiosk.ledger_history_lines().await {
        println!("   {}", line);
    }
    println!("   连接状态: {}", kiosk.connection_status().await.summary());

    kiosk.shutdown().await?;
    tablet.shutdown().await?;
    Ok(())
}
