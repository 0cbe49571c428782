use colored::{ColoredString, Colorize};

use vdm_core::{MachineStatus, MachineType};

pub struct MachineRow {
    pub id: String,
    pub name: String,
    pub status: MachineStatus,
    pub ip: String,
    pub owner: String,
}

pub fn status_label(status: MachineStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        MachineStatus::Up => text.green(),
        MachineStatus::Booting | MachineStatus::Stopping => text.yellow(),
        MachineStatus::Down | MachineStatus::Terminated => text.red(),
        MachineStatus::Unknown => text.dimmed(),
    }
}

pub fn print_machines(rows: &[MachineRow]) {
    if rows.is_empty() {
        println!("No machines.");
        return;
    }
    println!(
        "{:<24} {:<28} {:<12} {:<16} OWNER",
        "ID", "NAME", "STATUS", "IP"
    );
    for row in rows {
        println!(
            "{:<24} {:<28} {:<12} {:<16} {}",
            row.id,
            row.name,
            status_label(row.status),
            row.ip,
            row.owner,
        );
    }
}

pub fn print_types(types: &[MachineType]) {
    if types.is_empty() {
        println!("No machine types.");
        return;
    }
    println!("{:<20} {:<24} FLAVOR", "ID", "IMAGE");
    for t in types {
        println!("{:<20} {:<24} {}", t.id, t.image, t.flavor);
    }
}
