fn main() {
    mixpp::cli::run();
}
