//! Reference user agent: registers with a registrar and either waits for
//! calls (auto-answering with a static SDP) or places one.

use clap::Parser;
use sipua::dialog::authenticate::Credential;
use sipua::dialog::dialog_layer::DialogLayer;
use sipua::dialog::invitation::InviteOption;
use sipua::dialog::registration::Registration;
use sipua::message::{Method, Scheme, Uri};
use sipua::transaction::endpoint::EndpointBuilder;
use sipua::transport::udp::UdpConnection;
use sipua::transport::TransportLayer;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::unbounded_channel;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "ua", about = "SIP user agent reference driver")]
struct Args {
    #[arg(long)]
    username: String,
    #[arg(long)]
    domain: String,
    #[arg(long)]
    password: String,
    #[arg(long, default_value = "0.0.0.0")]
    local_ip: String,
    #[arg(long, default_value_t = 5060)]
    local_port: u16,
    #[arg(long)]
    display_name: Option<String>,
    /// Callee to dial (e.g. `sip:bob@example.com`); absent means answer.
    #[arg(long)]
    call: Option<String>,
    #[arg(long, default_value_t = 3600)]
    expires: u32,
}

const STATIC_ANSWER: &str = "v=0\r\no=sipua 0 0 IN IP4 0.0.0.0\r\ns=call\r\nc=IN IP4 0.0.0.0\r\nt=0 0\r\nm=audio 4000 RTP/AVP 0 8\r\na=rtpmap:0 PCMU/8000\r\n";

#[tokio::main]
async fn main() -> sipua::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let token = CancellationToken::new();

    let transport_layer = TransportLayer::new(token.child_token());
    let local = format!("{}:{}", args.local_ip, args.local_port).parse()?;
    let udp = UdpConnection::create_connection(local).await?;
    transport_layer.add_connection(udp.into());

    let endpoint = Arc::new(
        EndpointBuilder::new()
            .with_transport_layer(transport_layer)
            .with_cancel_token(token.clone())
            .build(),
    );
    let mut incoming = endpoint.incoming_transactions();
    {
        let endpoint = endpoint.clone();
        tokio::spawn(async move { endpoint.serve().await });
    }

    let credential = Credential {
        username: args.username.clone(),
        password: args.password.clone(),
        realm: None,
    };

    let mut registration = Registration::new(endpoint.inner.clone(), Some(credential.clone()));
    let response = registration
        .register(&args.domain, Some(args.expires))
        .await?;
    if !response.status_code.is_success() {
        error!("registration failed: {}", response.status_code);
        return Ok(());
    }

    let dialog_layer = DialogLayer::new(endpoint.inner.clone());
    let contact = registration
        .public_address
        .map(|addr| Uri::from_socket_addr(Scheme::Sip, Some(&args.username), addr))
        .unwrap_or_else(|| {
            Uri::new(
                Scheme::Sip,
                Some(&args.username),
                &args.local_ip,
                Some(args.local_port),
            )
        });

    // Refresh the registration at half its lifetime.
    {
        let refresh_domain = args.domain.clone();
        let expires = args.expires;
        let mut registration = registration;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(registration.refresh_interval()).await;
                if let Err(e) = registration.register(&refresh_domain, Some(expires)).await {
                    error!("registration refresh failed: {}", e);
                }
            }
        });
    }
    // Sweep terminated dialogs on the usual 30 s cadence.
    {
        let dialog_layer = dialog_layer.clone();
        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(Duration::from_secs(30));
            loop {
                sweep.tick().await;
                dialog_layer.cleanup_terminated(Instant::now());
            }
        });
    }

    if let Some(callee) = args.call {
        let (state_tx, mut state_rx) = unbounded_channel();
        tokio::spawn(async move {
            while let Some(state) = state_rx.recv().await {
                info!("call state: {}", state);
            }
        });
        let option = InviteOption {
            caller: Uri::new(
                Scheme::Sip,
                Some(&args.username),
                &args.domain,
                None,
            ),
            callee: Uri::try_from(callee.as_str())?,
            display_name: args.display_name.clone(),
            destination: None,
            content_type: None,
            offer: Some(STATIC_ANSWER.as_bytes().to_vec()),
            contact,
            credential: Some(credential),
            headers: None,
        };
        let (dialog, response) = dialog_layer.do_invite(option, state_tx).await?;
        match response {
            Some(resp) if resp.status_code.is_success() => {
                info!("call connected, hanging up in 5s");
                tokio::time::sleep(Duration::from_secs(5)).await;
                dialog.bye().await?;
            }
            Some(resp) => info!("call failed: {}", resp.status_code),
            None => info!("call ended without a final response"),
        }
        token.cancel();
        return Ok(());
    }

    info!("registered, waiting for calls");
    while let Some(tx) = incoming.recv().await {
        let tx = match dialog_layer.handle_incoming(tx).await {
            Ok(Some(tx)) => tx,
            Ok(None) => continue,
            Err(e) => {
                error!("in-dialog request failed: {}", e);
                continue;
            }
        };
        if tx.original.method != Method::Invite {
            continue;
        }
        let (state_tx, mut state_rx) = unbounded_channel();
        let dialog = match dialog_layer.get_or_create_server_invite(
            &tx,
            state_tx,
            None,
            Some(contact.clone()),
        ) {
            Ok(dialog) => dialog,
            Err(e) => {
                error!("could not create dialog: {}", e);
                continue;
            }
        };
        tokio::spawn(async move {
            while let Some(state) = state_rx.recv().await {
                info!("call state: {}", state);
            }
        });
        let answerer = dialog.clone();
        tokio::spawn(async move {
            // Ring briefly, then auto-answer with the static description.
            answerer.ringing().ok();
            tokio::time::sleep(Duration::from_millis(500)).await;
            answerer
                .accept(vec![], Some(STATIC_ANSWER.as_bytes().to_vec()))
                .ok();
        });
        tokio::spawn(async move {
            if let Err(e) = dialog.serve_invite(tx).await {
                error!("invite serving ended: {}", e);
            }
        });
    }
    Ok(())
}
