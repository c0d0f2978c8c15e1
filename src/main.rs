fn main() {
    std::process::exit(brokerqueue::app::startup::startup());
}
