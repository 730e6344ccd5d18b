use mockito::{Matcher, Server};
use service_api_module::{
    ClientServiceClient, NewComment, NewTicket, ServiceApiError, ServiceEndpoints,
    TicketPriority, TicketServiceClient, TicketStatus,
};

fn endpoints(server: &Server) -> ServiceEndpoints {
    ServiceEndpoints::new(&server.url(), &server.url()).with_token("svc-token")
}

#[test]
fn get_ticket_returns_none_on_404() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = Server::new();
    let mock = server
        .mock("GET", "/api/tickets/41")
        .match_header("authorization", "Bearer svc-token")
        .with_status(404)
        .with_body(r#"{"error":{"code":"TICKET_NOT_FOUND"}}"#)
        .expect(1)
        .create();

    let client = TicketServiceClient::new(&endpoints(&server))?;
    assert!(client.get_ticket(41)?.is_none());
    mock.assert();
    Ok(())
}

#[test]
fn get_ticket_unwraps_data_envelope() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = Server::new();
    let _mock = server
        .mock("GET", "/api/tickets/7")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data":{"id":7,"subject":"VPN down","status":"open","client_id":3}}"#)
        .create();

    let client = TicketServiceClient::new(&endpoints(&server))?;
    let ticket = client.get_ticket(7)?.expect("ticket");
    assert_eq!(ticket.subject, "VPN down");
    assert_eq!(ticket.status, TicketStatus::Open);
    assert_eq!(ticket.client_id, Some(3));
    Ok(())
}

#[test]
fn create_ticket_posts_json_body() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = Server::new();
    let mock = server
        .mock("POST", "/api/tickets")
        .match_header("content-type", "application/json")
        .match_body(Matcher::PartialJsonString(
            r#"{"subject":"Refund","priority":"high","client_id":12,"source":"email"}"#.to_string(),
        ))
        .with_status(201)
        .with_body(r#"{"data":{"id":99,"subject":"Refund","priority":"high","client_id":12}}"#)
        .expect(1)
        .create();

    let client = TicketServiceClient::new(&endpoints(&server))?;
    let created = client.create_ticket(&NewTicket {
        subject: "Refund".to_string(),
        description: "Please refund order 55".to_string(),
        status: TicketStatus::New,
        priority: TicketPriority::High,
        client_id: 12,
        category_id: None,
        assigned_agent_id: None,
        department: None,
        tags: vec![],
        source: "email".to_string(),
        custom_fields: serde_json::json!({}),
    })?;
    assert_eq!(created.id, 99);
    mock.assert();
    Ok(())
}

#[test]
fn add_comment_surfaces_validation_status() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = Server::new();
    let _mock = server
        .mock("POST", "/api/tickets/5/comments")
        .with_status(422)
        .with_body(r#"{"message":"The given data was invalid."}"#)
        .create();

    let client = TicketServiceClient::new(&endpoints(&server))?;
    let err = client
        .add_comment(
            5,
            &NewComment {
                content: String::new(),
                author_email: None,
                author_name: None,
                is_internal: false,
                source: "email".to_string(),
            },
        )
        .unwrap_err();
    assert!(matches!(err, ServiceApiError::Status { status: 422, .. }));
    assert!(err.is_permanent());
    Ok(())
}

#[test]
fn find_or_create_creates_missing_client() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = Server::new();
    let lookup = server
        .mock("GET", "/api/clients")
        .match_query(Matcher::UrlEncoded(
            "email".to_string(),
            "new@example.com".to_string(),
        ))
        .with_status(200)
        .with_body(r#"{"data":[]}"#)
        .expect(1)
        .create();
    let create = server
        .mock("POST", "/api/clients")
        .match_body(Matcher::PartialJsonString(
            r#"{"email":"new@example.com","name":"New Person"}"#.to_string(),
        ))
        .with_status(201)
        .with_body(r#"{"data":{"id":31,"email":"new@example.com","name":"New Person"}}"#)
        .expect(1)
        .create();

    let client = ClientServiceClient::new(&endpoints(&server))?;
    let summary = client.find_or_create("new@example.com", Some("New Person"))?;
    assert_eq!(summary.id, 31);
    lookup.assert();
    create.assert();
    Ok(())
}

#[test]
fn find_or_create_reuses_existing_client() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = Server::new();
    let _lookup = server
        .mock("GET", "/api/clients")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"data":[{"id":8,"email":"Known@Example.com"}]}"#)
        .create();
    let create = server.mock("POST", "/api/clients").expect(0).create();

    let client = ClientServiceClient::new(&endpoints(&server))?;
    let summary = client.find_or_create("known@example.com", None)?;
    assert_eq!(summary.id, 8);
    create.assert();
    Ok(())
}
