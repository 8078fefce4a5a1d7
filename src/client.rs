use std::error::Error;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use advmac::MacAddr6;
use dhcproto::v4::{self, DhcpOption, OptionCode};
use dhcproto::{Decodable, Encodable};
use shadowlease::v4::extensions::{rapid_commit_option, ShadowMessageExtV4};

const HELP: &str = "\
client - send one DHCPDISCOVER and print the reply

USAGE:
  client [OPTIONS]

OPTIONS:
  --server ADDR    server address [default: 127.0.0.1:67]
  --bind ADDR      local address [default: 0.0.0.0:68]
  --mac MAC        client hardware address [default: 00:11:22:33:44:55]
  --rapid-commit   ask for a rapid commit
";

fn main() -> Result<(), Box<dyn Error>> {
    let mut pargs = pico_args::Arguments::from_env();
    if pargs.contains(["-h", "--help"]) {
        print!("{HELP}");
        return Ok(());
    }
    let server: SocketAddr = pargs
        .opt_value_from_str("--server")?
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 67)));
    let bind: SocketAddr = pargs
        .opt_value_from_str("--bind")?
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 68)));
    let mac: MacAddr6 = pargs
        .opt_value_from_str("--mac")?
        .unwrap_or_else(|| MacAddr6::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]));
    let rapid_commit = pargs.contains("--rapid-commit");

    let msg = dhcpv4_discover(mac, rapid_commit).to_vec()?;

    let socket = UdpSocket::bind(bind)?;
    socket.set_broadcast(true)?;
    socket.set_read_timeout(Some(Duration::from_secs(5)))?;
    socket.send_to(&msg, server)?;

    let mut recv_buf = vec![0u8; 1500];
    let (recv_bytes, from) = socket.recv_from(&mut recv_buf)?;
    println!("received {recv_bytes} bytes from {from}");

    let reply = v4::Message::from_bytes(&recv_buf[..recv_bytes])?;
    println!(
        "{:?} yiaddr={} rapid_commit={}",
        reply.message_type(),
        reply.yiaddr(),
        reply.rapid_commit()
    );
    Ok(())
}

fn dhcpv4_discover(mac: MacAddr6, rapid_commit: bool) -> v4::Message {
    let mut msg = v4::Message::default();
    msg.set_chaddr(&mac.to_array());
    msg.set_flags(v4::Flags::default().set_broadcast());

    let opts = msg.opts_mut();
    opts.insert(DhcpOption::MessageType(v4::MessageType::Discover));
    opts.insert(DhcpOption::ParameterRequestList(vec![
        OptionCode::SubnetMask,
        OptionCode::Router,
        OptionCode::DomainNameServer,
        OptionCode::DomainName,
    ]));
    if rapid_commit {
        opts.insert(rapid_commit_option());
    }
    msg
}
