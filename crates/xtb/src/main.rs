use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use xtb_core::{
    config::Config,
    domain::{Address, ConversationId, InboxId},
    loopback::LoopbackNetwork,
    ports::TransportClient,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    xtb_core::logging::init("xtb")?;

    let cfg = Config::load().map_err(|e| {
        error!(error = %e, "startup aborted");
        e
    })?;

    info!(env = cfg.env.as_str(), "starting messaging client");
    let net = LoopbackNetwork::new();
    let client = Arc::new(net.connect(&cfg.wallet_key, cfg.env));
    let bot_inbox = client.identity().inbox_id.clone();

    tokio::spawn(bridge_stdin(net, bot_inbox));

    tokio::select! {
        res = xtb_core::app::run(client, &cfg) => {
            let report = res?;
            if let Some(e) = report.last_error {
                warn!(error = %e, "message listener gave up");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted; shutting down");
        }
    }

    Ok(())
}

/// Turn stdin lines of the form `<address> <text>` into direct messages to the
/// bot, and print whatever the bot answers.
async fn bridge_stdin(net: LoopbackNetwork, bot: InboxId) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut seen: HashMap<ConversationId, usize> = HashMap::new();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "stdin closed");
                return;
            }
        };

        let Some((addr, text)) = line.trim().split_once(char::is_whitespace) else {
            continue;
        };
        if !Address::looks_valid(addr) {
            eprintln!("expected `<0x address> <text>`");
            continue;
        }

        let sender = net.participant(Address::new(addr));
        let msg = match sender.send_dm(&bot, text.trim()) {
            Ok(m) => m,
            Err(e) => {
                eprintln!("send failed: {e}");
                continue;
            }
        };
        let Some(conv) = msg.conversation_id else {
            continue;
        };

        // Give the bot a moment to answer.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let messages = net.messages(&conv);
        let from = seen.get(&conv).copied().unwrap_or(0);
        for m in messages.iter().skip(from).filter(|m| m.sender == bot) {
            println!("{}: {}", m.sender, m.text.as_deref().unwrap_or(""));
        }
        seen.insert(conv, messages.len());
    }
}
