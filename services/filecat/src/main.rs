use filecat::FileCat;

#[tokio::main]
async fn main() {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let code = whisker::cli::run("filecat", argv, FileCat::new).await;
    std::process::exit(code);
}
