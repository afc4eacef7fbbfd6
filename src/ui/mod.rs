use colored::*;
use console::style;

pub fn init() {
    // Enable colored output on Windows
    #[cfg(windows)]
    colored::control::set_virtual_terminal(true).ok();
}

pub fn info(message: &str) {
    println!("{} {}", style("ℹ").blue(), message);
}

pub fn success(message: &str) {
    println!("{} {}", style("✓").green(), message.green());
}

pub fn error(message: &str) {
    eprintln!("{} {}", style("✗").red(), message.red());
}

pub fn warn(message: &str) {
    println!("{} {}", style("⚠").yellow(), message.yellow());
}

pub fn hint(message: &str) {
    println!("{} {}", style("💡").cyan(), message.dimmed());
}

pub fn section(title: &str) {
    println!("\n{}", title.bold().underline());
}

pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    // Calculate column widths
    let mut widths = headers.iter().map(|h| h.len()).collect::<Vec<_>>();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.chars().count());
            }
        }
    }

    for (i, header) in headers.iter().enumerate() {
        print!("{:width$} ", header.bold(), width = widths[i]);
    }
    println!();

    for width in &widths {
        print!("{} ", "-".repeat(*width).dimmed());
    }
    println!();

    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                print!("{:width$} ", cell, width = widths[i]);
            }
        }
        println!();
    }
}
