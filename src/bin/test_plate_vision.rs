use base64::{Engine as _, engine::general_purpose};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use plate_vision::api::PlateResponse;
use reqwest::{Body, Client, multipart};
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio_util::codec::{BytesCodec, FramedRead};

// Simple test client to send multiple requests to the plate vision service
#[derive(Parser)]
#[command(author = "Plate Vision Team", version = env!("CARGO_PKG_VERSION"), about = "Plate Vision test client")]
struct Args {
    /// Origin for the requests
    #[clap(short, long, default_value = "http://127.0.0.1:5000")]
    origin: String,

    /// Image to send
    #[clap(short, long)]
    image: String,

    /// Send the image base64 encoded to /ocr instead of multipart to /ocr-file
    #[clap(long, default_value_t = false)]
    base64: bool,

    /// Number of requests to make
    #[clap(short, long, default_value_t = 1)]
    number_of_requests: u32,

    /// Interval in milliseconds for making requests
    #[clap(long, default_value_t = 1000)]
    interval: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut futures = Vec::with_capacity(args.number_of_requests as usize);

    let pb = ProgressBar::new(args.number_of_requests as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )
            .unwrap()
            .progress_chars("#>-"),
    );

    println!(
        "Calling {}, {} times with {} ms interval",
        args.origin, args.number_of_requests, args.interval
    );

    let start_time = Instant::now();
    for i in 0..args.number_of_requests {
        let image = args.image.clone();
        let origin = args.origin.clone();
        let use_base64 = args.base64;
        futures.push(tokio::task::spawn(async move {
            if use_base64 {
                send_base64_request(origin, image).await
            } else {
                send_file_request(origin, image).await
            }
        }));
        pb.inc(1);
        if i < args.number_of_requests - 1 {
            tokio::time::sleep(std::time::Duration::from_millis(args.interval)).await;
        }
    }
    let results = futures::future::join_all(futures).await;
    pb.finish_with_message("All requests completed!");
    let runtime_duration = Instant::now().duration_since(start_time);
    let mut request_times: Vec<Duration> = Vec::with_capacity(args.number_of_requests as usize);

    let mut plate_response = PlateResponse::default();
    results.into_iter().for_each(|result| {
        if let Ok(Ok(result)) = result {
            plate_response = result.0;
            request_times.push(result.1);
        }
    });

    assert!(request_times.len() == args.number_of_requests as usize);
    println!("{plate_response:#?}");

    println!("Runtime duration: {runtime_duration:?}");
    if !request_times.is_empty() {
        let min_duration = request_times.iter().min().unwrap();
        let max_duration = request_times.iter().max().unwrap();
        let avg_duration = request_times.iter().sum::<Duration>() / request_times.len() as u32;

        println!(
            "Request times -- min: {:?}, avg: {:?}, max: {:?}",
            min_duration, avg_duration, max_duration
        );
    } else {
        println!("No request times to summarize");
    }

    Ok(())
}

async fn send_file_request(
    origin: String,
    image: String,
) -> anyhow::Result<(PlateResponse, Duration)> {
    let url = reqwest::Url::parse(&origin)?.join("ocr-file")?;
    let client = Client::new();

    let file = File::open(&image).await?;
    let stream = FramedRead::new(file, BytesCodec::new());
    let body = Body::wrap_stream(stream);
    let image_part = multipart::Part::stream(body).file_name(image);

    let form = multipart::Form::new().part("image", image_part);

    let request_start_time = Instant::now();
    let response = client.post(url).multipart(form).send().await?;
    parse_response(response, request_start_time).await
}

async fn send_base64_request(
    origin: String,
    image: String,
) -> anyhow::Result<(PlateResponse, Duration)> {
    let url = reqwest::Url::parse(&origin)?.join("ocr")?;
    let client = Client::new();

    let image_bytes = tokio::fs::read(&image).await?;
    let payload = serde_json::json!({
        "image": general_purpose::STANDARD.encode(&image_bytes),
    });

    let request_start_time = Instant::now();
    let response = client.post(url).json(&payload).send().await?;
    parse_response(response, request_start_time).await
}

async fn parse_response(
    response: reqwest::Response,
    request_start_time: Instant,
) -> anyhow::Result<(PlateResponse, Duration)> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        eprintln!("Error: Status: {status}, Body: {body}");
        return Err(anyhow::anyhow!("Request failed with status {}", status));
    }
    let plate_response = response.json::<PlateResponse>().await?;
    Ok((
        plate_response,
        Instant::now().duration_since(request_start_time),
    ))
}
