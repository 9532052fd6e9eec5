use synclink_proto::Message;
use tracing::info;

use crate::cmd::{bind_controller, is_disconnect, ListenArgs};
use crate::exit::{peer_error, CliResult, SUCCESS};
use crate::output::{print_listening, print_message, OutputFormat};

pub async fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let listener = bind_controller(&args.bind, args.token.as_deref()).await?;
    print_listening(listener.local_addr(), format);

    let mut session = tokio::select! {
        _ = tokio::signal::ctrl_c() => return Ok(SUCCESS),
        accepted = listener.accept() => accepted.map_err(|err| peer_error("accept failed", err))?,
    };
    let device_id = session.device().device_id.clone();
    info!(%device_id, peer = %session.peer_addr(), "device connected");
    print_message(&Message::Hello(session.device().clone()), &device_id, format);

    let mut printed = 0usize;
    loop {
        let message = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = session.recv() => match received {
                Ok(message) => message,
                Err(err) if is_disconnect(&err) => {
                    info!(%device_id, "device disconnected");
                    break;
                }
                Err(err) => return Err(peer_error("receive failed", err)),
            },
        };

        print_message(&message, &device_id, format);
        printed = printed.saturating_add(1);

        if let Some(count) = args.count {
            if printed >= count {
                break;
            }
        }
    }

    Ok(SUCCESS)
}
