#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
fn main() {
    linux::main();
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("cryptkey-keyscript is only supported on Linux hosts.");
    std::process::exit(1);
}
