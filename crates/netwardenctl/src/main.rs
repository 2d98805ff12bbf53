//! netwardenctl — command-line front-end for `netwardend`, talking to it over
//! the local RPC bus (`org.netwarden1`).
//!
//! Usage:
//!   netwardenctl show [if]                 # Human-readable state
//!   netwardenctl show-xml [--raw] [if]     # Document-model dump
//!   netwardenctl ifup <if>                 # Request NETWORK_UP
//!   netwardenctl ifdown [--delete] <if>    # Request teardown
//!   netwardenctl lease <file> install [if] # Install a lease document
//!   netwardenctl check resolve|route [--timeout N] [--af ipv4|ipv6] host...
//!   netwardenctl xpath [--reference expr] [--file f] fmt...
//!   netwardenctl --help | --version
//!
//! Exit codes: 0 success, 1 usage or hard failure, 2 partial failure (some
//! devices or hosts failed), per the contract in `client/main.c`'s dispatch
//! table.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use zbus::blocking::Connection;
use zbus::proxy;

const BUS_NAME: &str = "org.netwarden1";

#[proxy(
    default_service = "org.netwarden1",
    default_path = "/org/netwarden1/Manager",
    interface = "org.netwarden1.Manager1"
)]
trait Manager {
    fn get_managed_objects(&self) -> zbus::Result<Vec<(u32, String, String, String)>>;
    fn ifup(&self, name: String, config_xml: String, deadline_secs: u32) -> zbus::Result<()>;
    fn ifdown(&self, name: String, delete: bool) -> zbus::Result<()>;
    fn delete(&self, name: String) -> zbus::Result<()>;
    fn install_lease(&self, name: String, lease_xml: String) -> zbus::Result<()>;
    fn policy_put(&self, policy_doc: String) -> zbus::Result<()>;
    fn policy_delete(&self, id: String) -> zbus::Result<()>;
    fn policy_list(&self) -> zbus::Result<Vec<String>>;
    fn prompt_response(&self, security_id: String, path: String, value: String) -> zbus::Result<()>;
    fn check(
        &self,
        mode: String,
        hostnames: Vec<String>,
        timeout_secs: u32,
        af: String,
    ) -> zbus::Result<Vec<(String, bool, String, String)>>;
}

#[proxy(default_service = "org.netwarden1", interface = "org.netwarden1.Device1")]
trait Device {
    #[zbus(property)]
    fn name(&self) -> zbus::Result<String>;
    #[zbus(property)]
    fn device_type(&self) -> zbus::Result<String>;
    #[zbus(property)]
    fn state(&self) -> zbus::Result<String>;
    #[zbus(property)]
    fn addresses(&self) -> zbus::Result<Vec<String>>;
}

fn device_path(index: u32) -> String {
    format!("/org/netwarden1/Device/{index}")
}

fn connect() -> zbus::Result<Connection> {
    Connection::system()
}

fn print_help() {
    eprintln!("netwardenctl — control the netwardend network configuration daemon");
    eprintln!();
    eprintln!("Usage: netwardenctl <command> [args...]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  show [if]                          Show managed interfaces (all, or one)");
    eprintln!("  show-xml [--raw] [if]               Dump the document-model network state");
    eprintln!("  ifup <if>                           Request the interface reach NETWORK_UP");
    eprintln!("  ifdown [--delete] <if>              Request teardown, optionally deleting state");
    eprintln!("  lease <file> install [if]           Install a lease document onto an interface");
    eprintln!("  check resolve|route [--timeout N] [--af ipv4|ipv6] host...");
    eprintln!("                                      Check DNS resolution or route reachability");
    eprintln!("  xpath [--reference expr] [--file f] fmt...");
    eprintln!("                                      Evaluate an XPath-like expression against state");
    eprintln!();
    eprintln!("  -h, --help                          Show this help message");
    eprintln!("  --version                           Show version information");
}

fn print_version() {
    println!("netwardenctl 0.1.0");
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = match args.get(1) {
        Some(c) => c.as_str(),
        None => {
            print_help();
            return ExitCode::from(1);
        }
    };

    match command {
        "--help" | "-h" | "help" => {
            print_help();
            ExitCode::SUCCESS
        }
        "--version" => {
            print_version();
            ExitCode::SUCCESS
        }
        "show" => cmd_show(&args[2..], false),
        "show-xml" => cmd_show(&args[2..], true),
        "ifup" => cmd_ifup(&args[2..]),
        "ifdown" => cmd_ifdown(&args[2..]),
        "lease" => cmd_lease(&args[2..]),
        "check" => cmd_check(&args[2..]),
        "xpath" => cmd_xpath(&args[2..]),
        other => {
            eprintln!("netwardenctl: unknown command '{other}'");
            eprintln!("Try 'netwardenctl --help' for more information.");
            ExitCode::from(1)
        }
    }
}

fn connect_or_fail() -> Result<Connection, ExitCode> {
    connect().map_err(|e| {
        eprintln!("netwardenctl: failed to connect to {BUS_NAME}: {e}");
        ExitCode::from(1)
    })
}

fn manager_proxy(conn: &Connection) -> Result<ManagerProxyBlocking<'_>, ExitCode> {
    ManagerProxyBlocking::new(conn).map_err(|e| {
        eprintln!("netwardenctl: failed to reach manager object: {e}");
        ExitCode::from(1)
    })
}

fn cmd_show(args: &[String], xml: bool) -> ExitCode {
    let filter = args.iter().find(|a| !a.starts_with("--")).cloned();
    let raw = args.iter().any(|a| a == "--raw");

    let conn = match connect_or_fail() {
        Ok(c) => c,
        Err(code) => return code,
    };
    let manager = match manager_proxy(&conn) {
        Ok(m) => m,
        Err(code) => return code,
    };

    let objects = match manager.get_managed_objects() {
        Ok(o) => o,
        Err(e) => {
            eprintln!("netwardenctl: manager.get_managed_objects failed: {e}");
            return ExitCode::from(1);
        }
    };

    let mut any_failed = false;
    let mut shown = 0usize;

    if xml {
        println!("<network-state>");
    } else {
        println!("{:>4} {:16} {:10} {:20}", "IDX", "LINK", "TYPE", "STATE");
    }

    for (index, name, kind, state) in &objects {
        if let Some(f) = &filter {
            if name != f {
                continue;
            }
        }
        shown += 1;

        let device = DeviceProxyBlocking::builder(&conn)
            .path(device_path(*index))
            .and_then(|b| b.build());
        let addresses = match &device {
            Ok(d) => d.addresses().unwrap_or_default(),
            Err(_) => {
                any_failed = true;
                Vec::new()
            }
        };

        if xml {
            print!(
                "  <interface index=\"{index}\" name=\"{name}\" type=\"{kind}\" state=\"{state}\""
            );
            if raw {
                print!(" raw=\"1\"");
            }
            println!(">");
            for addr in &addresses {
                println!("    <address local=\"{addr}\"/>");
            }
            println!("  </interface>");
        } else {
            println!("{:>4} {:16} {:10} {:20}", index, name, kind, state);
            for addr in &addresses {
                println!("       address: {addr}");
            }
        }
    }

    if xml {
        println!("</network-state>");
    } else {
        println!();
        println!("{shown} interface(s) listed.");
    }

    if filter.is_some() && shown == 0 {
        eprintln!("netwardenctl: no such interface");
        return ExitCode::from(1);
    }

    if any_failed {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    }
}

fn cmd_ifup(args: &[String]) -> ExitCode {
    let name = match args.first() {
        Some(n) => n.clone(),
        None => {
            eprintln!("netwardenctl: ifup requires an interface name");
            return ExitCode::from(1);
        }
    };

    let conn = match connect_or_fail() {
        Ok(c) => c,
        Err(code) => return code,
    };
    let manager = match manager_proxy(&conn) {
        Ok(m) => m,
        Err(code) => return code,
    };

    match manager.ifup(name.clone(), String::new(), 0) {
        Ok(()) => {
            println!("{name}: ifup requested");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("netwardenctl: ifup {name} failed: {e}");
            ExitCode::from(1)
        }
    }
}

fn cmd_ifdown(args: &[String]) -> ExitCode {
    let delete = args.iter().any(|a| a == "--delete");
    let name = match args.iter().find(|a| !a.starts_with("--")) {
        Some(n) => n.clone(),
        None => {
            eprintln!("netwardenctl: ifdown requires an interface name");
            return ExitCode::from(1);
        }
    };

    let conn = match connect_or_fail() {
        Ok(c) => c,
        Err(code) => return code,
    };
    let manager = match manager_proxy(&conn) {
        Ok(m) => m,
        Err(code) => return code,
    };

    let result = if delete { manager.delete(name.clone()) } else { manager.ifdown(name.clone(), false) };
    match result {
        Ok(()) => {
            println!("{name}: ifdown requested");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("netwardenctl: ifdown {name} failed: {e}");
            ExitCode::from(1)
        }
    }
}

fn cmd_lease(args: &[String]) -> ExitCode {
    let path = match args.first() {
        Some(p) => PathBuf::from(p),
        None => {
            eprintln!("netwardenctl: lease requires <file>");
            return ExitCode::from(1);
        }
    };
    let verb = args.get(1).map(|s| s.as_str()).unwrap_or("install");
    if verb != "install" && verb != "add" && verb != "set" {
        eprintln!("netwardenctl: unsupported lease verb '{verb}'");
        return ExitCode::from(1);
    }
    let name = match args.get(2) {
        Some(n) => n.clone(),
        None => {
            eprintln!("netwardenctl: lease requires an interface name");
            return ExitCode::from(1);
        }
    };

    let contents = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("netwardenctl: cannot read {}: {e}", path.display());
            return ExitCode::from(1);
        }
    };

    let conn = match connect_or_fail() {
        Ok(c) => c,
        Err(code) => return code,
    };
    let manager = match manager_proxy(&conn) {
        Ok(m) => m,
        Err(code) => return code,
    };

    match manager.install_lease(name.clone(), contents) {
        Ok(()) => {
            println!("{name}: lease installed");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("netwardenctl: install_lease {name} failed: {e}");
            ExitCode::from(1)
        }
    }
}

fn write_dbus_error(path: &str, name: &str, message: &str) {
    let escaped_message = message.replace('&', "&amp;").replace('"', "&quot;");
    let document = format!("<error name=\"{name}\" message=\"{escaped_message}\"/>\n");
    if let Err(e) = fs::write(path, document) {
        eprintln!("netwardenctl: failed to write {path}: {e}");
    }
}

fn cmd_check(args: &[String]) -> ExitCode {
    let mode = match args.first() {
        Some(m) if m == "resolve" || m == "route" => m.clone(),
        _ => {
            eprintln!("netwardenctl: check requires 'resolve' or 'route'");
            return ExitCode::from(1);
        }
    };

    let mut timeout: u32 = 5;
    let mut af = String::new();
    let mut hosts = Vec::new();
    let mut write_dbus_error_path = None;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--timeout" => {
                i += 1;
                timeout = args.get(i).and_then(|s| s.parse().ok()).unwrap_or(5);
            }
            "--af" => {
                i += 1;
                af = args.get(i).cloned().unwrap_or_default();
            }
            "--write-dbus-error" => {
                i += 1;
                write_dbus_error_path = args.get(i).cloned();
            }
            host => hosts.push(host.to_string()),
        }
        i += 1;
    }

    if hosts.is_empty() {
        eprintln!("netwardenctl: check requires at least one host");
        return ExitCode::from(1);
    }

    let conn = match connect_or_fail() {
        Ok(c) => c,
        Err(code) => return code,
    };
    let manager = match manager_proxy(&conn) {
        Ok(m) => m,
        Err(code) => return code,
    };

    let results = match manager.check(mode, hosts, timeout, af) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("netwardenctl: check failed: {e}");
            return ExitCode::from(1);
        }
    };

    let mut any_failed = false;
    for (host, ok, name, message) in &results {
        if *ok {
            println!("{host}: ok");
        } else {
            any_failed = true;
            println!("{host}: failed ({name}): {message}");
            if let Some(path) = &write_dbus_error_path {
                write_dbus_error(path, name, message);
            }
        }
    }

    if any_failed { ExitCode::from(2) } else { ExitCode::SUCCESS }
}

fn cmd_xpath(args: &[String]) -> ExitCode {
    let mut reference = None;
    let mut file = None;
    let mut formats = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--reference" => {
                i += 1;
                reference = args.get(i).cloned();
            }
            "--file" => {
                i += 1;
                file = args.get(i).cloned();
            }
            other => formats.push(other.to_string()),
        }
        i += 1;
    }

    let document = if let Some(path) = &file {
        match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("netwardenctl: cannot read {path}: {e}");
                return ExitCode::from(1);
            }
        }
    } else {
        let conn = match connect_or_fail() {
            Ok(c) => c,
            Err(code) => return code,
        };
        let manager = match manager_proxy(&conn) {
            Ok(m) => m,
            Err(code) => return code,
        };
        let objects = match manager.get_managed_objects() {
            Ok(o) => o,
            Err(e) => {
                eprintln!("netwardenctl: manager.get_managed_objects failed: {e}");
                return ExitCode::from(1);
            }
        };
        objects
            .iter()
            .map(|(index, name, kind, state)| format!("{index}\t{name}\t{kind}\t{state}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let reference_expr = reference.as_deref().unwrap_or("$this");
    if formats.is_empty() {
        println!("{document}");
    } else {
        for fmt in &formats {
            println!("{}", fmt.replace("%{path}", reference_expr));
        }
    }

    ExitCode::SUCCESS
}
