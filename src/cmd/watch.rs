//! Station board follower: `kds watch`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use console::style;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use kds::config::KdsConfig;
use kds::kitchen::poller::{HttpTicketSource, PollEvent, StationPoller};
use kds_common::{
    OrderType, Role, Station, TicketItemStatus, TicketStatus, TicketView,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn cmd_watch(
    config: &KdsConfig,
    station: Option<Station>,
    url: Option<String>,
    role: Option<Role>,
) -> Result<()> {
    let Some(station) = station.or(config.poller.station) else {
        bail!("No station given: pass --station or set poller.station in kds.toml");
    };
    let role = role.or(config.poller.role).unwrap_or(match station {
        Station::Kitchen => Role::Kitchen,
        Station::Bar => Role::Bar,
    });
    let url = url.unwrap_or_else(|| config.poller.base_url.clone());

    let source = Arc::new(HttpTicketSource::new(&url, role, REQUEST_TIMEOUT)?);
    let poller = StationPoller::new(source, station, config.poller.settings())
        .with_retention(config.retention.policy()?);

    let (tx, mut rx) = mpsc::channel(32);
    let cancel = CancellationToken::new();
    let handle = poller.spawn(tx, cancel.clone());

    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    println!(
        "Watching {} board at {} as {} (Ctrl+C to stop)",
        style(station).cyan().bold(),
        url,
        role
    );

    while let Some(event) = rx.recv().await {
        match event {
            PollEvent::Synced { board, .. } => render_board(station, &board),
            PollEvent::NewTickets { ids } => {
                println!("{} {} new ticket(s)", style("●").green().bold(), ids.len());
            }
            PollEvent::ConnectionLost { failures, error } => {
                println!(
                    "{} connection lost after {} failed polls: {}",
                    style("✗").red().bold(),
                    failures,
                    style(error).dim()
                );
            }
            PollEvent::ConnectionRestored => {
                println!("{} connection restored", style("✓").green().bold());
            }
        }
    }

    handle.await?;
    Ok(())
}

fn render_board(station: Station, board: &[TicketView]) {
    println!();
    println!(
        "{}",
        style(format!("── {} · {} ticket(s) ──", station, board.len())).bold()
    );
    for view in board {
        let rush = if view.ticket.priority > 0 {
            format!(" {}", style("RUSH").red().bold())
        } else {
            String::new()
        };
        println!(
            "#{:<4} {:<12} {}{}",
            view.order_number,
            status_label(view.ticket.status),
            order_label(view),
            rush
        );
        for item in &view.items {
            println!(
                "      {} {}x {}",
                item_marker(item.status),
                item.quantity,
                item.title
            );
            if let Some(prep) = &item.preparation {
                println!("          {}", style(prep).dim());
            }
            if let Some(note) = &item.instructions {
                println!("          {}", style(note).italic().dim());
            }
        }
        if let Some(sibling) = view.sibling_status {
            println!(
                "      {}",
                style(format!("{}: {}", station.sibling(), sibling)).dim()
            );
        }
    }
}

fn status_label(status: TicketStatus) -> String {
    match status {
        TicketStatus::New => style("NEW").yellow().bold().to_string(),
        TicketStatus::InProgress => style("COOKING").cyan().to_string(),
        TicketStatus::Completed => style("DONE").green().to_string(),
        TicketStatus::Recalled => style("RECALLED").magenta().to_string(),
        TicketStatus::Cancelled => style("CANCELLED").red().dim().to_string(),
    }
}

fn order_label(view: &TicketView) -> String {
    match (view.order_type, &view.table_label) {
        (OrderType::DineIn, Some(table)) => format!("table {}", table),
        (order_type, _) => order_type.to_string(),
    }
}

fn item_marker(status: TicketItemStatus) -> String {
    match status {
        TicketItemStatus::Pending => style("[ ]").to_string(),
        TicketItemStatus::InProgress => style("[~]").cyan().to_string(),
        TicketItemStatus::Done => style("[x]").green().to_string(),
        TicketItemStatus::Cancelled => style("[-]").red().dim().to_string(),
    }
}
