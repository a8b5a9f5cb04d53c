fn main() -> std::process::ExitCode {
    onionlog_lib::run()
}
